//! Phase sequencing for a single deployment run.
//!
//! Provisioning, snapshot persistence, convergence and install run in
//! order; the first failing phase ends the run with a `DeployError`
//! naming it.

use std::path::PathBuf;
use std::sync::Arc;

use forge_cloud::{ProvisioningBackend, ResourceProvisioner};
use forge_converge::{ConvergeReport, ConvergeRequest, ConvergenceEngine};
use forge_core::{Deployment, Shutdown};
use forge_http::JsonTransport;
use forge_install::{InstallOrchestrator, ManagementApi};
use forge_remote::RemoteExecutor;
use tracing::{info, warn};

use crate::error::{DeployError, DeployResult};

/// Outcome of a completed deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    pub deployment: String,
    pub snapshot: PathBuf,
    pub converged: ConvergeReport,
    pub management_url: Option<String>,
}

/// Provision, persist, converge and install, in that order.
///
/// No phase is rolled back when a later one fails; the infrastructure is
/// left in place for inspection and a later rebuild.
pub struct DeploymentCoordinator {
    provisioner: Arc<ResourceProvisioner>,
    executor: Arc<dyn RemoteExecutor>,
    management: Option<Arc<dyn JsonTransport>>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for DeploymentCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentCoordinator")
            .field("provisioner", &self.provisioner)
            .finish_non_exhaustive()
    }
}

impl DeploymentCoordinator {
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        executor: Arc<dyn RemoteExecutor>,
        deployment: &Deployment,
        shutdown: Shutdown,
    ) -> Self {
        let provisioner = ResourceProvisioner::new(backend, executor.clone(), &deployment.config, shutdown.clone());
        Self {
            provisioner: Arc::new(provisioner),
            executor,
            management: None,
            shutdown,
        }
    }

    /// Send management API calls through `transport` instead of connecting
    /// to the primary node.
    pub fn with_management_transport(mut self, transport: Arc<dyn JsonTransport>) -> Self {
        self.management = Some(transport);
        self
    }

    pub fn provisioner(&self) -> &ResourceProvisioner {
        &self.provisioner
    }

    /// Run every phase against `deployment`.
    pub async fn deploy(&self, deployment: &mut Deployment) -> DeployResult<DeployReport> {
        info!(deployment = %deployment.name, "starting deployment");
        self.provision(deployment).await?;
        let snapshot = self.persist(deployment)?;
        let converged = self.converge(deployment, &ConvergeRequest::full()).await?;
        self.install(deployment).await?;

        let management_url = deployment.management_url();
        match &management_url {
            Some(url) => info!(deployment = %deployment.name, %url, "deployment complete, management console ready"),
            None => warn!(deployment = %deployment.name, "deployment complete, primary node has no public address"),
        }
        Ok(DeployReport {
            deployment: deployment.name.clone(),
            snapshot,
            converged,
            management_url,
        })
    }

    /// Build fresh infrastructure, or rebuild the existing cluster in place
    /// when `cloud.use_existing_cluster` is set.
    pub async fn provision(&self, deployment: &mut Deployment) -> DeployResult<()> {
        let result = if deployment.config.cloud.use_existing_cluster {
            info!(deployment = %deployment.name, "rebuilding existing cluster");
            self.provisioner.rebuild(deployment).await
        } else {
            info!(deployment = %deployment.name, "building new cluster");
            self.provisioner.build(deployment).await
        };
        result.map_err(DeployError::Provision)
    }

    /// Save the cluster snapshot so later runs can resume against it.
    pub fn persist(&self, deployment: &Deployment) -> DeployResult<PathBuf> {
        let path = deployment.snapshot_path();
        deployment
            .cluster
            .snapshot()
            .save(&path)
            .map_err(DeployError::Persist)?;
        info!(snapshot = %path.display(), "cluster state saved");
        Ok(path)
    }

    pub async fn converge(
        &self,
        deployment: &mut Deployment,
        request: &ConvergeRequest,
    ) -> DeployResult<ConvergeReport> {
        let engine = ConvergenceEngine::new(self.executor.clone(), self.shutdown.clone())
            .with_rebuilder(self.provisioner.clone());
        engine
            .converge(deployment, request)
            .await
            .map_err(DeployError::Converge)
    }

    pub async fn install(&self, deployment: &Deployment) -> DeployResult<()> {
        let orchestrator = match &self.management {
            Some(transport) => {
                let address = deployment.cluster.master().floating_ip.as_deref().unwrap_or_default();
                let root = ManagementApi::root_for(address, deployment.config.install.port);
                let api = ManagementApi::new(transport.clone(), root);
                InstallOrchestrator::new(api, self.executor.clone(), self.shutdown.clone())
            }
            None => InstallOrchestrator::for_deployment(deployment, self.executor.clone(), self.shutdown.clone())
                .map_err(DeployError::Install)?,
        };
        orchestrator.install(deployment).await.map_err(DeployError::Install)
    }

    /// Tear down the deployment's stack and verify the project is empty.
    pub async fn cleanup(&self) -> DeployResult<()> {
        self.provisioner.cleanup().await.map_err(DeployError::Provision)
    }
}
