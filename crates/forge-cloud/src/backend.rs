//! The provisioning API as seen by the orchestrator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CloudResult;

/// Stack statuses the orchestrator reacts to.
pub mod status {
    pub const CREATE_IN_PROGRESS: &str = "CREATE_IN_PROGRESS";
    pub const CREATE_COMPLETE: &str = "CREATE_COMPLETE";
    pub const CREATE_FAILED: &str = "CREATE_FAILED";
    pub const DELETE_IN_PROGRESS: &str = "DELETE_IN_PROGRESS";
    pub const DELETE_COMPLETE: &str = "DELETE_COMPLETE";

    pub const SERVER_ACTIVE: &str = "ACTIVE";
    pub const SERVER_REBUILD: &str = "REBUILD";
    pub const SERVER_ERROR: &str = "ERROR";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackStatus {
    pub status: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    pub flavor_id: String,
    pub internal_ip: Option<String>,
    pub floating_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIp {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub id: String,
    pub network_id: String,
    pub cidr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Router {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: String,
    pub name: String,
}

/// Compute, network, block-storage, image and orchestration operations.
///
/// Implementations perform exactly one API call per method; retries are
/// applied by the caller.
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn create_stack(&self, name: &str, template: &Value, params: &Value) -> CloudResult<StackRef>;
    async fn get_stack(&self, stack: &StackRef) -> CloudResult<StackStatus>;
    async fn delete_stack(&self, stack: &StackRef) -> CloudResult<()>;
    async fn list_stacks(&self) -> CloudResult<Vec<StackRef>>;

    async fn list_servers(&self) -> CloudResult<Vec<ServerInfo>>;
    async fn get_server(&self, id: &str) -> CloudResult<ServerInfo>;
    async fn rebuild_server(&self, id: &str, image_id: &str) -> CloudResult<()>;
    /// RAM of a flavor, in MB.
    async fn flavor_ram(&self, flavor_id: &str) -> CloudResult<u64>;
    /// Create a keypair and return its private key material.
    async fn create_keypair(&self, name: &str) -> CloudResult<String>;

    async fn list_floating_ips(&self) -> CloudResult<Vec<FloatingIp>>;
    async fn delete_floating_ip(&self, id: &str) -> CloudResult<()>;
    async fn list_networks(&self) -> CloudResult<Vec<Network>>;
    async fn list_subnets(&self) -> CloudResult<Vec<Subnet>>;
    async fn list_routers(&self) -> CloudResult<Vec<Router>>;
    async fn add_gateway_to_router(&self, router_id: &str, network_id: &str) -> CloudResult<()>;

    async fn list_volumes(&self) -> CloudResult<Vec<Volume>>;
    async fn list_images(&self) -> CloudResult<Vec<Image>>;
}
