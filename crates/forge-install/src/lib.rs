//! forge-install — drive the cluster-management service through install.
//!
//! `ManagementApi` wraps the REST calls, `progress` decides what a polled
//! request status means and `InstallOrchestrator` sequences the whole run.

pub mod api;
pub mod error;
pub mod orchestrator;
pub mod progress;

pub use api::ManagementApi;
pub use error::{InstallError, InstallResult};
pub use orchestrator::InstallOrchestrator;
pub use progress::{Progress, Verdict};
