//! Install error types.

use forge_core::{Classify, ErrorKind, PollError};
use forge_http::HttpError;
use forge_remote::RemoteError;
use serde_json::Value;
use thiserror::Error;

/// Result type alias for install operations.
pub type InstallResult<T> = Result<T, InstallError>;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("unexpected {what} response: {reason}")]
    Malformed { what: &'static str, reason: String },

    #[error("install request ended {status} at {percent}%: {response}")]
    Failed {
        status: String,
        percent: f64,
        response: Value,
    },

    #[error("{0} is required when custom repositories are enabled")]
    MissingRepository(&'static str),

    #[error("primary node has no address for the management endpoint")]
    NoEndpoint,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Poll(#[from] PollError),
}

impl InstallError {
    pub fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        InstallError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

impl Classify for InstallError {
    fn kind(&self) -> ErrorKind {
        match self {
            InstallError::Http(e) => match e.kind() {
                // Error responses from the service are install failures.
                ErrorKind::HttpStatus | ErrorKind::NotFound => ErrorKind::Install,
                other => other,
            },
            InstallError::Malformed { .. } => ErrorKind::MalformedResponse,
            InstallError::Failed { .. } => ErrorKind::Install,
            InstallError::MissingRepository(_) | InstallError::NoEndpoint => ErrorKind::Config,
            InstallError::Remote(e) => e.kind(),
            InstallError::Poll(e) => e.kind(),
        }
    }
}
