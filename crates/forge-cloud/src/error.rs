//! Error types for cloud access and provisioning.

use forge_core::{Classify, ConfigError, ErrorKind, PollError, WorkspaceError};
use forge_http::HttpError;
use forge_remote::RemoteError;
use thiserror::Error;

/// Result type alias for backend calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// Result type alias for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// A single backend call failed.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: String },

    #[error("unexpected {what} response: {reason}")]
    Malformed { what: &'static str, reason: String },
}

impl CloudError {
    pub fn malformed(what: &'static str, reason: impl Into<String>) -> Self {
        CloudError::Malformed {
            what,
            reason: reason.into(),
        }
    }
}

impl Classify for CloudError {
    fn kind(&self) -> ErrorKind {
        match self {
            CloudError::Http(e) => e.kind(),
            CloudError::NotFound { .. } => ErrorKind::NotFound,
            CloudError::Malformed { .. } => ErrorKind::MalformedResponse,
        }
    }
}

/// Infrastructure could not be brought to the requested state.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error("foreign resources exist on this project: {0}")]
    Conflict(String),

    #[error(
        "resources remain after cleanup: floating ips {floating_ips:?}, servers {servers:?}, volumes {volumes:?}"
    )]
    Leftovers {
        floating_ips: Vec<String>,
        servers: Vec<String>,
        volumes: Vec<String>,
    },

    #[error("stack {stack} failed to create: {reason}")]
    StackFailed { stack: String, reason: String },

    #[error("stack {stack} was still creating after {waited:?}")]
    StackTimeout {
        stack: String,
        waited: std::time::Duration,
    },

    #[error("stack {stack} failed to delete ({status}): {reason}")]
    StackDeleteFailed {
        stack: String,
        status: String,
        reason: String,
    },

    #[error("failed to delete floating ips: {}", .0.join("; "))]
    FloatingIpDelete(Vec<String>),

    #[error("{node} did not start rebuilding within {waited:?}")]
    RebuildTimeout {
        node: String,
        waited: std::time::Duration,
    },

    #[error("{node} entered ERROR state after rebuild")]
    ServerError { node: String },

    #[error("no server named {node} exists in the project")]
    ServerMissing { node: String },

    #[error("{node} is missing {field} in the server listing")]
    Incomplete { node: String, field: &'static str },

    #[error("{} node rebuild(s) failed: {}", .0.len(), describe(.0))]
    Rebuilds(Vec<(String, ProvisionError)>),
}

fn describe(failures: &[(String, ProvisionError)]) -> String {
    failures
        .iter()
        .map(|(node, e)| format!("{node}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ProvisionError {
    /// Node the failure is attributed to, when there is exactly one.
    pub fn node(&self) -> Option<&str> {
        match self {
            ProvisionError::RebuildTimeout { node, .. }
            | ProvisionError::ServerError { node }
            | ProvisionError::ServerMissing { node }
            | ProvisionError::Incomplete { node, .. } => Some(node),
            ProvisionError::Rebuilds(failures) if failures.len() == 1 => Some(&failures[0].0),
            _ => None,
        }
    }
}

impl Classify for ProvisionError {
    fn kind(&self) -> ErrorKind {
        match self {
            ProvisionError::Cloud(e) => e.kind(),
            ProvisionError::Config(_) | ProvisionError::Workspace(_) => ErrorKind::Config,
            ProvisionError::Remote(e) => e.kind(),
            ProvisionError::Poll(e) => e.kind(),
            ProvisionError::Conflict(_) | ProvisionError::Leftovers { .. } => ErrorKind::Conflict,
            // Listing raced the resources becoming queryable.
            ProvisionError::Incomplete { .. } => ErrorKind::MalformedResponse,
            ProvisionError::StackFailed { .. }
            | ProvisionError::StackTimeout { .. }
            | ProvisionError::StackDeleteFailed { .. }
            | ProvisionError::FloatingIpDelete(_)
            | ProvisionError::RebuildTimeout { .. }
            | ProvisionError::ServerError { .. }
            | ProvisionError::ServerMissing { .. }
            | ProvisionError::Rebuilds(_) => ErrorKind::Provisioning,
        }
    }
}
