//! Transport error types.

use std::time::Duration;

use forge_core::{Classify, ErrorKind};
use thiserror::Error;

/// Result type alias for HTTP transport operations.
pub type HttpResult<T> = Result<T, HttpError>;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tls setup for {url} failed: {reason}")]
    Tls { url: String, reason: String },

    #[error("request to {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: hyper::Error,
    },

    #[error("{method} {url} returned {status} {reason}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        reason: String,
        body: String,
    },

    #[error("malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },
}

impl HttpError {
    /// HTTP status code, when the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn malformed(url: &str, reason: impl Into<String>) -> Self {
        HttpError::Malformed {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}

impl Classify for HttpError {
    fn kind(&self) -> ErrorKind {
        match self {
            HttpError::InvalidUrl { .. } => ErrorKind::Config,
            HttpError::Connect { .. } | HttpError::Tls { .. } | HttpError::Request { .. } => {
                ErrorKind::Connection
            }
            HttpError::Timeout { .. } => ErrorKind::Timeout,
            HttpError::Status { status: 404, .. } => ErrorKind::NotFound,
            HttpError::Status { .. } => ErrorKind::HttpStatus,
            HttpError::Malformed { .. } => ErrorKind::MalformedResponse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> HttpError {
        HttpError::Status {
            method: "GET".to_string(),
            url: "https://h/api".to_string(),
            status: code,
            reason: String::new(),
            body: String::new(),
        }
    }

    #[test]
    fn classification() {
        assert_eq!(status(404).kind(), ErrorKind::NotFound);
        assert_eq!(status(500).kind(), ErrorKind::HttpStatus);
        assert_eq!(HttpError::malformed("u", "empty").kind(), ErrorKind::MalformedResponse);
        assert!(!status(503).kind().is_transient());
    }
}
