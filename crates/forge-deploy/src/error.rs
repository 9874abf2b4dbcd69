//! Phase-tagged deployment errors.

use std::fmt;

use forge_cloud::ProvisionError;
use forge_converge::ConvergeError;
use forge_core::{Classify, ErrorKind, SnapshotError};
use forge_install::InstallError;
use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

/// Stage of a deployment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Provision,
    Persist,
    Converge,
    Install,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Provision => "provision",
            Phase::Persist => "persist",
            Phase::Converge => "converge",
            Phase::Install => "install",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("provision phase failed: {0}")]
    Provision(#[source] ProvisionError),

    #[error("persist phase failed: {0}")]
    Persist(#[source] SnapshotError),

    #[error("converge phase failed: {0}")]
    Converge(#[source] ConvergeError),

    #[error("install phase failed: {0}")]
    Install(#[source] InstallError),
}

impl DeployError {
    pub fn phase(&self) -> Phase {
        match self {
            DeployError::Provision(_) => Phase::Provision,
            DeployError::Persist(_) => Phase::Persist,
            DeployError::Converge(_) => Phase::Converge,
            DeployError::Install(_) => Phase::Install,
        }
    }

    /// The offending node, when the failure is attributable to one.
    pub fn node(&self) -> Option<&str> {
        match self {
            DeployError::Provision(e) => e.node(),
            DeployError::Converge(e) => e.node(),
            DeployError::Persist(_) | DeployError::Install(_) => None,
        }
    }
}

impl Classify for DeployError {
    fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Provision(e) => e.kind(),
            DeployError::Persist(e) => e.kind(),
            DeployError::Converge(e) => e.kind(),
            DeployError::Install(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_the_phase() {
        let err = DeployError::Converge(ConvergeError::UnknownNode("edge1".to_string()));
        assert_eq!(err.phase(), Phase::Converge);
        assert_eq!(err.node(), Some("edge1"));
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.to_string(), "converge phase failed: unknown node edge1");
    }

    #[test]
    fn install_failures_carry_the_response() {
        let err = DeployError::Install(InstallError::Failed {
            status: "FAILED".to_string(),
            percent: 40.0,
            response: serde_json::json!({"Requests": {"request_status": "FAILED"}}),
        });
        assert_eq!(err.phase().to_string(), "install");
        assert_eq!(err.kind(), ErrorKind::Install);
        assert!(err.to_string().contains("request_status"));
        assert_eq!(err.node(), None);
    }
}
