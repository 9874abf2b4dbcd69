//! Client for the cluster-management REST API.

use std::sync::Arc;

use forge_core::config::InstallConfig;
use forge_http::{HttpClient, JsonTransport, Method, TlsMode};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{InstallError, InstallResult};
use crate::progress::Progress;

/// Header the management service requires on every mutating call.
const REQUESTED_BY: (&str, &str) = ("X-Requested-By", "ambari");

pub struct ManagementApi {
    transport: Arc<dyn JsonTransport>,
    root: String,
}

impl std::fmt::Debug for ManagementApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagementApi")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl ManagementApi {
    /// `root` is the API base URL, e.g. `https://host:8443/api/v1/`.
    pub fn new(transport: Arc<dyn JsonTransport>, root: impl Into<String>) -> Self {
        let mut root = root.into();
        if !root.ends_with('/') {
            root.push('/');
        }
        Self { transport, root }
    }

    /// Connect to the service on `address` with its factory credentials.
    ///
    /// The service presents a self-signed certificate, so TLS verification
    /// is switched off for this client only.
    pub fn connect(address: &str, install: &InstallConfig) -> InstallResult<Self> {
        let client = HttpClient::builder()
            .tls(TlsMode::Insecure)
            .basic_auth(&install.admin_user, &install.default_password)?
            .header(REQUESTED_BY.0, REQUESTED_BY.1)?
            .build()?;
        Ok(Self::new(Arc::new(client), Self::root_for(address, install.port)))
    }

    /// API base URL of the service listening on `address`.
    pub fn root_for(address: &str, port: u16) -> String {
        format!("https://{address}:{port}/api/v1/")
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    async fn call(&self, method: Method, url: &str, body: Option<&Value>) -> InstallResult<Option<Value>> {
        debug!(%method, %url, "management request");
        Ok(self.transport.send(method, url, body).await?)
    }

    /// Register a package repository for a stack version.
    pub async fn put_repository(
        &self,
        stack_type: &str,
        stack_version: &str,
        os_type: &str,
        repo_id: &str,
        definition: &Value,
    ) -> InstallResult<()> {
        let url = format!(
            "{}stacks/{stack_type}/versions/{stack_version}/operating_systems/{os_type}/repositories/{repo_id}",
            self.root
        );
        self.call(Method::PUT, &url, Some(definition)).await?;
        Ok(())
    }

    pub async fn post_blueprint(&self, name: &str, blueprint: &Value) -> InstallResult<()> {
        let url = format!("{}blueprints/{name}", self.root);
        self.call(Method::POST, &url, Some(blueprint)).await?;
        Ok(())
    }

    /// Submit the host mapping, which starts the install. Returns the
    /// tracking URL of the install request.
    pub async fn post_host_mapping(&self, cluster: &str, mapping: &Value) -> InstallResult<String> {
        let url = format!("{}clusters/{cluster}", self.root);
        let body = self
            .call(Method::POST, &url, Some(mapping))
            .await?
            .ok_or_else(|| InstallError::malformed("host mapping", "empty body"))?;
        body["href"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| InstallError::malformed("host mapping", "missing `href`"))
    }

    pub async fn request_progress(&self, href: &str) -> InstallResult<(Progress, Value)> {
        let body = self
            .call(Method::GET, href, None)
            .await?
            .ok_or_else(|| InstallError::malformed("request", "empty body"))?;
        let progress = Progress::from_response(&body)
            .ok_or_else(|| InstallError::malformed("request", "missing `Requests` status"))?;
        Ok((progress, body))
    }

    pub async fn change_password(&self, user: &str, old: &str, new: &str) -> InstallResult<()> {
        let url = format!("{}users/{user}", self.root);
        let body = json!({
            "Users": {
                "user_name": user,
                "old_password": old,
                "password": new,
            }
        });
        self.call(Method::PUT, &url, Some(&body)).await?;
        Ok(())
    }
}
