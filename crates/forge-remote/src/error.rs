use std::path::PathBuf;
use std::time::Duration;

use forge_core::{Cancelled, Classify, ErrorKind};
use thiserror::Error;

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{node} ({address}) is not reachable yet")]
    NotReachable { node: String, address: String },

    #[error("{node} ({address}) unreachable after {attempts} attempts")]
    Unreachable {
        node: String,
        address: String,
        attempts: u32,
    },

    #[error("command on {node} timed out after {after:?}")]
    Timeout { node: String, after: Duration },

    #[error("{command} failed on {node} with exit code {exit_code:?}: {stderr_tail}")]
    Failed {
        node: String,
        command: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("cannot write command log {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{node} has no address or key to connect with")]
    MissingTarget { node: String },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Classify for RemoteError {
    fn kind(&self) -> ErrorKind {
        match self {
            RemoteError::NotReachable { .. } => ErrorKind::Connection,
            RemoteError::Timeout { .. } => ErrorKind::Timeout,
            RemoteError::MissingTarget { .. } => ErrorKind::Config,
            RemoteError::Cancelled(_) => ErrorKind::Cancelled,
            RemoteError::Spawn { .. }
            | RemoteError::Unreachable { .. }
            | RemoteError::Failed { .. }
            | RemoteError::Log { .. } => ErrorKind::RemoteExecution,
        }
    }
}
