//! `ProvisioningBackend` over the OpenStack REST APIs.

use std::sync::Arc;

use async_trait::async_trait;
use forge_core::config::{CloudConfig, Endpoints};
use forge_core::ConfigError;
use forge_http::{HttpClient, HttpError, JsonTransport, Method, TlsMode};
use serde_json::{Value, json};
use tracing::debug;

use crate::backend::{
    FloatingIp, Image, Network, ProvisioningBackend, Router, ServerInfo, StackRef, StackStatus,
    Subnet, Volume,
};
use crate::error::{CloudError, CloudResult, ProvisionError};

/// Talks to Heat, Nova, Neutron, Cinder and Glance through one transport.
pub struct OpenStackBackend {
    transport: Arc<dyn JsonTransport>,
    endpoints: Endpoints,
}

impl std::fmt::Debug for OpenStackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenStackBackend")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl OpenStackBackend {
    pub fn new(transport: Arc<dyn JsonTransport>, endpoints: Endpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    /// Build an authenticated client from settings and the token variable.
    pub fn connect(cloud: &CloudConfig) -> Result<Self, ProvisionError> {
        let token = std::env::var(&cloud.token_env).map_err(|_| {
            ConfigError::Invalid(format!("environment variable {} is not set", cloud.token_env))
        })?;
        let tls = if cloud.verify_tls {
            TlsMode::Verified
        } else {
            TlsMode::Insecure
        };
        let client = HttpClient::builder()
            .tls(tls)
            .header("X-Auth-Token", &token)
            .and_then(|b| b.build())
            .map_err(CloudError::from)?;
        Ok(Self::new(Arc::new(client), cloud.endpoints.clone()))
    }

    async fn call(&self, method: Method, url: String, body: Option<Value>) -> CloudResult<Option<Value>> {
        debug!(%method, %url, "openstack request");
        Ok(self.transport.send(method, &url, body.as_ref()).await?)
    }

    async fn get(&self, url: String, what: &'static str) -> CloudResult<Value> {
        self.call(Method::GET, url, None)
            .await?
            .ok_or_else(|| CloudError::malformed(what, "empty body"))
    }

    /// GET a collection and map every element of `key`.
    async fn list<T>(
        &self,
        url: String,
        key: &'static str,
        parse: impl Fn(&Value) -> CloudResult<T>,
    ) -> CloudResult<Vec<T>> {
        let body = self.get(url, key).await?;
        body[key]
            .as_array()
            .ok_or_else(|| CloudError::malformed(key, format!("missing `{key}` array")))?
            .iter()
            .map(parse)
            .collect()
    }

    fn stack_url(&self, stack: &StackRef) -> String {
        format!("{}/stacks/{}/{}", self.endpoints.orchestration, stack.name, stack.id)
    }
}

fn field(v: &Value, key: &str, what: &'static str) -> CloudResult<String> {
    match &v[key] {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(CloudError::malformed(what, format!("missing `{key}`"))),
    }
}

fn opt_field(v: &Value, key: &str) -> Option<String> {
    v[key].as_str().map(str::to_string)
}

/// Map an HTTP 404 to a typed not-found.
fn not_found(what: &'static str, id: &str) -> impl FnOnce(CloudError) -> CloudError {
    let id = id.to_string();
    move |e| match e {
        CloudError::Http(HttpError::Status { status: 404, .. }) => CloudError::NotFound { what, id },
        other => other,
    }
}

/// Fixed and floating address of a server.
///
/// Only the first network is considered. Entries carry an
/// `OS-EXT-IPS:type` tag; without one, the first address is fixed and the
/// second floating.
fn server_addresses(server: &Value) -> (Option<String>, Option<String>) {
    let Some(entries) = server["addresses"]
        .as_object()
        .and_then(|nets| nets.values().next())
        .and_then(Value::as_array)
    else {
        return (None, None);
    };
    let by_type = |t: &str| {
        entries
            .iter()
            .find(|e| e["OS-EXT-IPS:type"] == t)
            .and_then(|e| opt_field(e, "addr"))
    };
    let tagged = entries.iter().any(|e| e.get("OS-EXT-IPS:type").is_some());
    if tagged {
        (by_type("fixed"), by_type("floating"))
    } else {
        (
            entries.first().and_then(|e| opt_field(e, "addr")),
            entries.get(1).and_then(|e| opt_field(e, "addr")),
        )
    }
}

fn parse_server(v: &Value) -> CloudResult<ServerInfo> {
    let (internal_ip, floating_ip) = server_addresses(v);
    Ok(ServerInfo {
        id: field(v, "id", "server")?,
        name: field(v, "name", "server")?,
        status: field(v, "status", "server")?,
        flavor_id: field(&v["flavor"], "id", "server flavor")?,
        internal_ip,
        floating_ip,
    })
}

#[async_trait]
impl ProvisioningBackend for OpenStackBackend {
    async fn create_stack(&self, name: &str, template: &Value, params: &Value) -> CloudResult<StackRef> {
        let url = format!("{}/stacks", self.endpoints.orchestration);
        let body = json!({
            "stack_name": name,
            "template": template,
            "parameters": params,
        });
        let reply = self
            .call(Method::POST, url, Some(body))
            .await?
            .ok_or_else(|| CloudError::malformed("stack", "empty body"))?;
        Ok(StackRef {
            id: field(&reply["stack"], "id", "stack")?,
            name: name.to_string(),
        })
    }

    async fn get_stack(&self, stack: &StackRef) -> CloudResult<StackStatus> {
        let body = self
            .get(self.stack_url(stack), "stack")
            .await
            .map_err(not_found("stack", &stack.name))?;
        Ok(StackStatus {
            status: field(&body["stack"], "stack_status", "stack")?,
            reason: opt_field(&body["stack"], "stack_status_reason"),
        })
    }

    async fn delete_stack(&self, stack: &StackRef) -> CloudResult<()> {
        self.call(Method::DELETE, self.stack_url(stack), None)
            .await
            .map_err(not_found("stack", &stack.name))?;
        Ok(())
    }

    async fn list_stacks(&self) -> CloudResult<Vec<StackRef>> {
        let url = format!("{}/stacks", self.endpoints.orchestration);
        self.list(url, "stacks", |s| {
            Ok(StackRef {
                id: field(s, "id", "stack")?,
                name: field(s, "stack_name", "stack")?,
            })
        })
        .await
    }

    async fn list_servers(&self) -> CloudResult<Vec<ServerInfo>> {
        let url = format!("{}/servers/detail", self.endpoints.compute);
        self.list(url, "servers", parse_server).await
    }

    async fn get_server(&self, id: &str) -> CloudResult<ServerInfo> {
        let url = format!("{}/servers/{id}", self.endpoints.compute);
        let body = self.get(url, "server").await.map_err(not_found("server", id))?;
        parse_server(&body["server"])
    }

    async fn rebuild_server(&self, id: &str, image_id: &str) -> CloudResult<()> {
        let url = format!("{}/servers/{id}/action", self.endpoints.compute);
        let body = json!({ "rebuild": { "imageRef": image_id } });
        self.call(Method::POST, url, Some(body))
            .await
            .map_err(not_found("server", id))?;
        Ok(())
    }

    async fn flavor_ram(&self, flavor_id: &str) -> CloudResult<u64> {
        let url = format!("{}/flavors/{flavor_id}", self.endpoints.compute);
        let body = self.get(url, "flavor").await?;
        body["flavor"]["ram"]
            .as_u64()
            .ok_or_else(|| CloudError::malformed("flavor", "missing `ram`"))
    }

    async fn create_keypair(&self, name: &str) -> CloudResult<String> {
        let url = format!("{}/os-keypairs", self.endpoints.compute);
        let body = json!({ "keypair": { "name": name } });
        let reply = self
            .call(Method::POST, url, Some(body))
            .await?
            .ok_or_else(|| CloudError::malformed("keypair", "empty body"))?;
        field(&reply["keypair"], "private_key", "keypair")
    }

    async fn list_floating_ips(&self) -> CloudResult<Vec<FloatingIp>> {
        let url = format!("{}/v2.0/floatingips", self.endpoints.network);
        self.list(url, "floatingips", |f| {
            Ok(FloatingIp {
                id: field(f, "id", "floating ip")?,
                address: field(f, "floating_ip_address", "floating ip")?,
            })
        })
        .await
    }

    async fn delete_floating_ip(&self, id: &str) -> CloudResult<()> {
        let url = format!("{}/v2.0/floatingips/{id}", self.endpoints.network);
        self.call(Method::DELETE, url, None)
            .await
            .map_err(not_found("floating ip", id))?;
        Ok(())
    }

    async fn list_networks(&self) -> CloudResult<Vec<Network>> {
        let url = format!("{}/v2.0/networks", self.endpoints.network);
        self.list(url, "networks", |n| {
            Ok(Network {
                id: field(n, "id", "network")?,
                name: opt_field(n, "name").unwrap_or_default(),
            })
        })
        .await
    }

    async fn list_subnets(&self) -> CloudResult<Vec<Subnet>> {
        let url = format!("{}/v2.0/subnets", self.endpoints.network);
        self.list(url, "subnets", |s| {
            Ok(Subnet {
                id: field(s, "id", "subnet")?,
                network_id: field(s, "network_id", "subnet")?,
                cidr: opt_field(s, "cidr").unwrap_or_default(),
            })
        })
        .await
    }

    async fn list_routers(&self) -> CloudResult<Vec<Router>> {
        let url = format!("{}/v2.0/routers", self.endpoints.network);
        self.list(url, "routers", |r| {
            Ok(Router {
                id: field(r, "id", "router")?,
                name: opt_field(r, "name").unwrap_or_default(),
            })
        })
        .await
    }

    async fn add_gateway_to_router(&self, router_id: &str, network_id: &str) -> CloudResult<()> {
        let url = format!("{}/v2.0/routers/{router_id}", self.endpoints.network);
        let body = json!({ "router": { "external_gateway_info": { "network_id": network_id } } });
        self.call(Method::PUT, url, Some(body)).await?;
        Ok(())
    }

    async fn list_volumes(&self) -> CloudResult<Vec<Volume>> {
        let url = format!("{}/volumes", self.endpoints.volume);
        self.list(url, "volumes", |v| {
            Ok(Volume {
                id: field(v, "id", "volume")?,
                name: opt_field(v, "name").unwrap_or_default(),
            })
        })
        .await
    }

    async fn list_images(&self) -> CloudResult<Vec<Image>> {
        let url = format!("{}/v2/images", self.endpoints.image);
        self.list(url, "images", |i| {
            Ok(Image {
                id: field(i, "id", "image")?,
                name: opt_field(i, "name").unwrap_or_default(),
            })
        })
        .await
    }
}
