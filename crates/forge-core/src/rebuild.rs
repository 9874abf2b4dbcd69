//! Node rebuild capability.
//!
//! Convergence can recover a node by rebuilding it from its base image.
//! It only sees this trait, so the retry state machine runs without a
//! cloud behind it.

use async_trait::async_trait;
use thiserror::Error;

use crate::cluster::{Node, SshCredentials};
use crate::error::{Classify, ErrorKind};

/// A failed rebuild, reduced to its classification and diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rebuild of {node} failed ({kind}): {message}")]
pub struct RebuildError {
    pub node: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl RebuildError {
    pub fn new<E: Classify + std::fmt::Display>(node: &str, err: &E) -> Self {
        Self {
            node: node.to_string(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl Classify for RebuildError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// Reprovision a single node in place and release its data volume.
#[async_trait]
pub trait NodeRebuilder: Send + Sync {
    async fn rebuild_node(
        &self,
        node: &mut Node,
        credentials: &SshCredentials,
    ) -> Result<(), RebuildError>;
}
