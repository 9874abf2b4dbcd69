//! forge-converge — configuration-management convergence.
//!
//! # Components
//!
//! - **`attributes`** — runtime attribute tree and its flattening into a recipe
//! - **`engine`** — per-node convergence tasks with retry and rebuild-on-failure

pub mod attributes;
pub mod engine;
pub mod error;

pub use attributes::{flatten, runtime_attributes, write_runtime_recipe};
pub use engine::{ConvergeReport, ConvergeRequest, ConvergenceEngine};
pub use error::{ConvergeError, ConvergeResult, NodeFailure};
