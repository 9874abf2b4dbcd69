use forge_core::{Cancelled, Classify, ErrorKind, RebuildError, WorkspaceError};
use forge_remote::RemoteError;
use thiserror::Error;

pub type ConvergeResult<T> = Result<T, ConvergeError>;

/// Why one node did not converge.
#[derive(Debug, Error)]
pub enum NodeFailure {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("agent install failed on {node} (exit {exit_code:?}): {stderr_tail}")]
    AgentInstall {
        node: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("{runlist} failed on {node} after {attempts} attempt(s): {stderr_tail}")]
    Exhausted {
        node: String,
        runlist: String,
        attempts: u32,
        stderr_tail: String,
    },

    #[error(transparent)]
    Rebuild(#[from] RebuildError),
}

impl NodeFailure {
    /// Whether the failure stops the other nodes too.
    pub fn aborts_run(&self) -> bool {
        !matches!(self, NodeFailure::Remote(RemoteError::Unreachable { .. }))
    }
}

impl Classify for NodeFailure {
    fn kind(&self) -> ErrorKind {
        match self {
            NodeFailure::Remote(e) => e.kind(),
            NodeFailure::AgentInstall { .. } | NodeFailure::Exhausted { .. } => ErrorKind::RemoteExecution,
            NodeFailure::Rebuild(e) => e.kind(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConvergeError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("convergence failed on {} node(s): {}", .failures.len(), describe(.failures))]
    Nodes {
        failures: Vec<(String, NodeFailure)>,
        /// Nodes that stopped early because another node failed.
        aborted: Vec<String>,
    },

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

fn describe(failures: &[(String, NodeFailure)]) -> String {
    failures
        .iter()
        .map(|(node, e)| format!("{node}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConvergeError {
    /// The failing node, when exactly one failed.
    pub fn node(&self) -> Option<&str> {
        match self {
            ConvergeError::UnknownNode(node) => Some(node),
            ConvergeError::Nodes { failures, .. } if failures.len() == 1 => Some(&failures[0].0),
            _ => None,
        }
    }
}

impl Classify for ConvergeError {
    fn kind(&self) -> ErrorKind {
        match self {
            ConvergeError::Workspace(_) | ConvergeError::UnknownNode(_) => ErrorKind::Config,
            ConvergeError::Nodes { failures, .. } => failures
                .first()
                .map(|(_, e)| e.kind())
                .unwrap_or(ErrorKind::RemoteExecution),
            ConvergeError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}
