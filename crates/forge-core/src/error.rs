//! Error taxonomy shared by every StackForge crate.
//!
//! Each crate keeps its own `thiserror` enum; `ErrorKind` is the common
//! vocabulary that retry decisions and phase reporting are made on.

use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or contradictory settings.
    Config,
    /// Foreign or leftover cloud resources.
    Conflict,
    /// A stack or server reached a failure terminal state.
    Provisioning,
    /// Unreachable host or a remote command that kept failing.
    RemoteExecution,
    /// The cluster-management service rejected or failed the install.
    Install,
    /// Connection refused, reset or otherwise dropped.
    Connection,
    /// A request or connection attempt ran out of time.
    Timeout,
    /// A response body was empty, truncated or not the expected JSON shape.
    MalformedResponse,
    /// The addressed resource does not exist.
    NotFound,
    /// The remote service answered with an HTTP error status.
    HttpStatus,
    /// The operation was aborted through a shutdown signal.
    Cancelled,
}

/// Kinds that are retried transparently by default.
pub const TRANSIENT: &[ErrorKind] = &[
    ErrorKind::Connection,
    ErrorKind::Timeout,
    ErrorKind::MalformedResponse,
];

impl ErrorKind {
    /// Whether this kind belongs to the default transient set.
    pub fn is_transient(self) -> bool {
        TRANSIENT.contains(&self)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Config => "config",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Provisioning => "provisioning",
            ErrorKind::RemoteExecution => "remote-execution",
            ErrorKind::Install => "install",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MalformedResponse => "malformed-response",
            ErrorKind::NotFound => "not-found",
            ErrorKind::HttpStatus => "http-status",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Implemented by every error type that can flow through a `RetryPolicy`.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

/// Result type alias for configuration handling.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Classify for ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}
