//! forge-core — shared building blocks for StackForge deployments.
//!
//! Holds the cluster data model and everything the orchestration crates
//! agree on: configuration, the error-kind taxonomy, bounded retries and
//! cancellable polling.
//!
//! # Components
//!
//! - **`config`** — `forge.toml` parsing and validation
//! - **`template`** — node-group template expansion into `Node`s
//! - **`cluster`** — `Node`, `Cluster`, persisted `ClusterSnapshot`
//! - **`deployment`** — run-scoped `Deployment`, `Workspace`, `Payloads`
//! - **`retry`** — fixed-delay `RetryPolicy` keyed on `ErrorKind`
//! - **`poll`** — `Shutdown` signal and deadline-bounded `Poller`
//! - **`rebuild`** — `NodeRebuilder` capability used by convergence

pub mod cluster;
pub mod config;
pub mod deployment;
pub mod error;
pub mod poll;
pub mod rebuild;
pub mod retry;
pub mod template;
pub mod testing;

pub use cluster::{Cluster, ClusterSnapshot, Node, SnapshotError, SshCredentials, SshTarget};
pub use config::{DeployConfig, Timing};
pub use deployment::{Deployment, Payloads, Workspace, WorkspaceError};
pub use error::{Classify, ConfigError, ConfigResult, ErrorKind, TRANSIENT};
pub use poll::{Cancelled, PollError, Poller, Shutdown};
pub use rebuild::{NodeRebuilder, RebuildError};
pub use retry::RetryPolicy;
pub use template::{ClusterTemplate, NodeGroup};

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
