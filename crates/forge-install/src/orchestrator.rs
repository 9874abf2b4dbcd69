//! The install phase.
//!
//! Repositories, blueprint and host mapping are submitted in order; the
//! host mapping starts the install, whose tracked request is then polled
//! until it reaches a terminal state. Credentials are rotated last.

use std::sync::Arc;

use forge_core::{Deployment, PollError, Poller, RetryPolicy, Shutdown, TRANSIENT};
use forge_remote::{OutputSink, RemoteError, RemoteExecutor, run_checked, shell_quote};
use tracing::{error, info, warn};

use crate::api::ManagementApi;
use crate::error::{InstallError, InstallResult};
use crate::progress::Verdict;

pub struct InstallOrchestrator {
    api: ManagementApi,
    executor: Arc<dyn RemoteExecutor>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for InstallOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallOrchestrator")
            .field("api", &self.api)
            .finish_non_exhaustive()
    }
}

impl InstallOrchestrator {
    pub fn new(api: ManagementApi, executor: Arc<dyn RemoteExecutor>, shutdown: Shutdown) -> Self {
        Self {
            api,
            executor,
            shutdown,
        }
    }

    /// Target the management service on the deployment's primary node.
    pub fn for_deployment(
        deployment: &Deployment,
        executor: Arc<dyn RemoteExecutor>,
        shutdown: Shutdown,
    ) -> InstallResult<Self> {
        let address = deployment
            .cluster
            .master()
            .floating_ip
            .as_deref()
            .ok_or(InstallError::NoEndpoint)?;
        let api = ManagementApi::connect(address, &deployment.config.install)?;
        Ok(Self::new(api, executor, shutdown))
    }

    pub async fn install(&self, deployment: &Deployment) -> InstallResult<()> {
        let config = &deployment.config;
        let timing = &config.timing;
        let install = &config.install;
        let payloads = &deployment.payloads;
        let api = &self.api;
        let name = config.stack_name();
        let name = name.as_str();
        let mut shutdown = self.shutdown.clone();

        info!(api = %api.root(), "preparing cluster install");

        if install.define_custom_repos {
            let stack_repo = payloads
                .stack_repo
                .as_ref()
                .ok_or(InstallError::MissingRepository("stack repository"))?;
            let utils_repo = payloads
                .utils_repo
                .as_ref()
                .ok_or(InstallError::MissingRepository("utils repository"))?;
            let repos = [
                (format!("{}-{}", install.stack_type, install.stack_version), stack_repo),
                (format!("{}-UTILS-{}", install.stack_type, install.utils_version), utils_repo),
            ];
            for (repo_id, definition) in &repos {
                let repo_id = repo_id.as_str();
                timing
                    .api_policy()
                    .execute("repository definition", TRANSIENT, || async move {
                        api.put_repository(
                            &install.stack_type,
                            &install.stack_version,
                            &install.os_type,
                            repo_id,
                            definition,
                        )
                        .await
                    })
                    .await?;
                info!(repo = repo_id, "repository definition submitted");
                shutdown.sleep(timing.settle_delay()).await.map_err(PollError::from)?;
            }
        }

        let blueprint = &payloads.blueprint;
        RetryPolicy::new(timing.blueprint_attempts, timing.api_policy().delay)
            .execute("blueprint", TRANSIENT, || async move { api.post_blueprint(name, blueprint).await })
            .await?;
        info!(blueprint = name, "blueprint submitted");
        shutdown.sleep(timing.settle_delay()).await.map_err(PollError::from)?;

        let mapping = &payloads.host_mapping;
        let href = timing
            .api_policy()
            .execute("host mapping", TRANSIENT, || async move { api.post_host_mapping(name, mapping).await })
            .await?;
        info!(request = %href, "host mapping applied, install started");
        shutdown
            .sleep(timing.install_start_delay())
            .await
            .map_err(PollError::from)?;

        self.wait_for_install(deployment, &href).await?;

        timing
            .api_policy()
            .execute("admin password", TRANSIENT, || async move {
                api.change_password(&install.admin_user, &install.default_password, &install.admin_password)
                    .await
            })
            .await?;
        info!(user = %install.admin_user, "changed management password");

        if let Some(password) = &install.mysql_root_password {
            self.set_database_password(deployment, password).await?;
        }
        Ok(())
    }

    async fn wait_for_install(&self, deployment: &Deployment, href: &str) -> InstallResult<()> {
        let api = &self.api;
        let grace = deployment.config.install.grace_percent;
        let mut poller = Poller::new("install request", deployment.config.timing.install_poll(), self.shutdown.clone());
        loop {
            poller.tick().await?;
            let (progress, response) = deployment
                .config
                .timing
                .api_policy()
                .execute("install status", TRANSIENT, || async move { api.request_progress(href).await })
                .await?;

            match progress.verdict(grace) {
                Verdict::Completed => {
                    info!(deployment = %deployment.name, elapsed = ?poller.elapsed(), "install completed");
                    return Ok(());
                }
                Verdict::Running => {
                    let percent = progress.percent.trunc() as u64;
                    info!(deployment = %deployment.name, percent, "install in progress");
                }
                Verdict::Retry => {
                    warn!(deployment = %deployment.name, status = %progress.status, "install status timed out");
                }
                Verdict::NearlyComplete => {
                    warn!(
                        status = %progress.status,
                        percent = progress.percent,
                        "install failed beyond the grace threshold, continuing"
                    );
                    return Ok(());
                }
                Verdict::Failed => {
                    error!(status = %progress.status, percent = progress.percent, "install failed");
                    return Err(InstallError::Failed {
                        status: progress.status,
                        percent: progress.percent,
                        response,
                    });
                }
            }
        }
    }

    async fn set_database_password(&self, deployment: &Deployment, password: &str) -> InstallResult<()> {
        let master = deployment.cluster.master();
        let target = deployment
            .cluster
            .ssh_target(master)
            .ok_or_else(|| RemoteError::MissingTarget {
                node: master.name.clone(),
            })?;
        let script = format!("mysqladmin -u root password {}", shell_quote(password));
        run_checked(&*self.executor, &target, &script, &mut OutputSink::discard()).await?;
        info!(node = %master.name, "database root password set");
        Ok(())
    }
}
