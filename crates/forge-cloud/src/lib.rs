//! forge-cloud — infrastructure provisioning.
//!
//! `ResourceProvisioner` drives a `ProvisioningBackend` through stack
//! creation, node rebuilds and cleanup. `OpenStackBackend` is the REST
//! implementation; `FakeCloud` keeps the whole project in memory.

pub mod backend;
pub mod error;
pub mod fake;
pub mod heat;
pub mod openstack;
pub mod provisioner;

pub use backend::{ProvisioningBackend, ServerInfo, StackRef, StackStatus};
pub use error::{CloudError, CloudResult, ProvisionError, ProvisionResult};
pub use fake::FakeCloud;
pub use heat::{HeatTemplate, NetworkPlan, TemplateSettings};
pub use openstack::OpenStackBackend;
pub use provisioner::ResourceProvisioner;
