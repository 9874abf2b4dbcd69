//! forge-deploy — run a deployment from bare project to installed cluster.
//!
//! `DeploymentCoordinator` sequences provisioning, snapshot persistence,
//! convergence and install. A failure in any phase stops the run and is
//! reported as a `DeployError` tagged with that phase.

pub mod coordinator;
pub mod error;

pub use coordinator::{DeployReport, DeploymentCoordinator};
pub use error::{DeployError, DeployResult, Phase};
