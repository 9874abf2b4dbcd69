//! Cluster infrastructure lifecycle: build, rebuild and cleanup.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use forge_core::{
    Classify, Cluster, ConfigError, DeployConfig, Deployment, ErrorKind, Node, NodeRebuilder,
    PollError, Poller, RebuildError, RetryPolicy, Shutdown, SshCredentials, SshTarget, Timing,
    TRANSIENT,
};
use forge_remote::{OutputSink, RemoteError, RemoteExecutor, run_checked, shell_quote, wait_reachable};
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::backend::{ProvisioningBackend, ServerInfo, StackRef, status};
use crate::error::{CloudError, CloudResult, ProvisionError, ProvisionResult};
use crate::heat::{HeatTemplate, NetworkPlan, TemplateSettings};

/// Brings the cloud project in line with a deployment's cluster.
pub struct ResourceProvisioner {
    backend: Arc<dyn ProvisioningBackend>,
    executor: Arc<dyn RemoteExecutor>,
    config: DeployConfig,
    shutdown: Shutdown,
}

impl std::fmt::Debug for ResourceProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceProvisioner")
            .field("stack", &self.config.stack_name())
            .finish_non_exhaustive()
    }
}

impl ResourceProvisioner {
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        executor: Arc<dyn RemoteExecutor>,
        config: &DeployConfig,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            backend,
            executor,
            config: config.clone(),
            shutdown,
        }
    }

    fn timing(&self) -> &Timing {
        &self.config.timing
    }

    /// One backend call under the API retry policy.
    async fn call<T, F, Fut>(&self, what: &str, op: F) -> ProvisionResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CloudResult<T>>,
    {
        Ok(self.timing().api_policy().execute(what, TRANSIENT, op).await?)
    }

    /// Provision a fresh cluster and record the cloud identifiers on every node.
    pub async fn build(&self, deployment: &mut Deployment) -> ProvisionResult<()> {
        let key_name = self.resolve_keypair(deployment).await?;
        self.cleanup().await?;

        let plan = self.network_plan().await?;
        let settings = TemplateSettings::from_config(&self.config, &key_name);
        let template = HeatTemplate::generate(&settings, deployment.cluster.nodes(), &plan);
        template.write(&deployment.workspace.template_path())?;

        let stack = self.create_stack(&template).await?;
        self.wait_for_stack(&stack).await?;
        self.populate(&mut deployment.cluster).await?;
        info!(stack = %stack.name, nodes = deployment.cluster.nodes().len(), "cluster provisioned");
        Ok(())
    }

    async fn resolve_keypair(&self, deployment: &mut Deployment) -> ProvisionResult<String> {
        let credentials = &deployment.cluster.credentials;
        if let Some(name) = credentials.key_name.clone() {
            if credentials.private_key.is_none() {
                return Err(ConfigError::Missing("cluster.existing_key_path").into());
            }
            info!(key = %name, "using existing keypair");
            return Ok(name);
        }

        let backend = &*self.backend;
        let name = deployment.name.as_str();
        let material = self
            .call("create keypair", || async move { backend.create_keypair(name).await })
            .await?;
        let path = deployment.workspace.write_private_key(name, &material)?;
        info!(key = %name, path = %path.display(), "generated keypair");

        let credentials = &mut deployment.cluster.credentials;
        credentials.key_name = Some(deployment.name.clone());
        credentials.private_key = Some(path);
        Ok(deployment.name.clone())
    }

    /// Remove this deployment's stack and verify the project is empty.
    ///
    /// Fails with a conflict, without deleting anything, when a stack not
    /// owned by this deployment exists.
    pub async fn cleanup(&self) -> ProvisionResult<()> {
        let backend = &*self.backend;
        let stacks = self
            .call("list stacks", || async move { backend.list_stacks().await })
            .await?;

        let ours = self.config.stack_name();
        match stacks.as_slice() {
            [] => debug!("no stacks to clean up"),
            [stack] if stack.name.to_lowercase() == ours => {
                info!(stack = %stack.name, "deleting existing deployment stack");
                let attempts = RetryPolicy::new(self.timing().stack_delete_attempts, self.timing().settle_delay());
                let this = self;
                attempts
                    .execute("stack deletion", &[ErrorKind::Provisioning], || async move {
                        this.destroy(stack).await
                    })
                    .await?;
            }
            [stack] => {
                return Err(ProvisionError::Conflict(format!(
                    "stack {} does not belong to deployment stack {ours}",
                    stack.name
                )));
            }
            many => {
                let names: Vec<&str> = many.iter().map(|s| s.name.as_str()).collect();
                return Err(ProvisionError::Conflict(format!("multiple stacks: {}", names.join(", "))));
            }
        }

        self.settle().await
    }

    /// Floating IPs first, then the stack itself, then wait for it to go.
    async fn destroy(&self, stack: &StackRef) -> ProvisionResult<()> {
        self.delete_floating_ips().await?;

        let backend = &*self.backend;
        let deleted = self
            .call("delete stack", || async move { backend.delete_stack(stack).await })
            .await;
        match deleted {
            Ok(()) => {}
            Err(ProvisionError::Cloud(CloudError::NotFound { .. })) => return Ok(()),
            Err(e) => return Err(e),
        }

        let mut poller = Poller::new(
            format!("deletion of {}", stack.name),
            self.timing().stack_poll(),
            self.shutdown.clone(),
        );
        loop {
            let observed = self
                .call("stack status", || async move { backend.get_stack(stack).await })
                .await;
            let current = match observed {
                Ok(current) => current,
                Err(ProvisionError::Cloud(CloudError::NotFound { .. })) => break,
                Err(e) => return Err(e),
            };
            match current.status.as_str() {
                status::DELETE_COMPLETE => break,
                s if s.ends_with("FAILED") => {
                    return Err(ProvisionError::StackDeleteFailed {
                        stack: stack.name.clone(),
                        status: current.status.clone(),
                        reason: current.reason.unwrap_or_default(),
                    });
                }
                s => debug!(stack = %stack.name, status = s, "waiting for stack deletion"),
            }
            poller.tick().await?;
        }
        info!(stack = %stack.name, "stack deleted");
        Ok(())
    }

    /// Release every floating IP in the project concurrently.
    async fn delete_floating_ips(&self) -> ProvisionResult<()> {
        let backend = &*self.backend;
        let ips = self
            .call("list floating ips", || async move { backend.list_floating_ips().await })
            .await?;
        if ips.is_empty() {
            return Ok(());
        }
        info!(count = ips.len(), "deleting floating ips");

        let results = join_all(ips.iter().map(|ip| async move {
            let id = ip.id.as_str();
            let result = self
                .call("delete floating ip", || async move { backend.delete_floating_ip(id).await })
                .await;
            (ip, result)
        }))
        .await;

        let mut failures = Vec::new();
        for (ip, result) in results {
            match result {
                Ok(()) | Err(ProvisionError::Cloud(CloudError::NotFound { .. })) => {}
                Err(e) => {
                    error!(address = %ip.address, error = %e, "failed to delete floating ip");
                    failures.push(format!("{}: {e}", ip.address));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::FloatingIpDelete(failures))
        }
    }

    /// Re-check until no floating IPs, servers or volumes remain.
    async fn settle(&self) -> ProvisionResult<()> {
        let backend = &*self.backend;
        let checks = self.timing().settle_checks.max(1);
        let mut shutdown = self.shutdown.clone();
        let mut leftovers = (Vec::new(), Vec::new(), Vec::new());

        for check in 1..=checks {
            let ips = self
                .call("list floating ips", || async move { backend.list_floating_ips().await })
                .await?;
            let servers = self
                .call("list servers", || async move { backend.list_servers().await })
                .await?;
            let volumes = self
                .call("list volumes", || async move { backend.list_volumes().await })
                .await?;
            if ips.is_empty() && servers.is_empty() && volumes.is_empty() {
                return Ok(());
            }
            debug!(
                check,
                floating_ips = ips.len(),
                servers = servers.len(),
                volumes = volumes.len(),
                "resources still present"
            );
            leftovers = (
                ips.into_iter().map(|f| f.address).collect(),
                servers.into_iter().map(|s| s.name).collect(),
                volumes.into_iter().map(|v| v.name).collect(),
            );
            if check < checks {
                shutdown
                    .sleep(self.timing().settle_delay())
                    .await
                    .map_err(PollError::from)?;
            }
        }

        let (floating_ips, servers, volumes) = leftovers;
        error!(?floating_ips, ?servers, ?volumes, "project not empty after cleanup");
        Err(ProvisionError::Leftovers {
            floating_ips,
            servers,
            volumes,
        })
    }

    /// Reuse the project's network when it has exactly one private
    /// network, subnet and router next to the external network.
    async fn network_plan(&self) -> ProvisionResult<NetworkPlan> {
        if !self.config.cloud.try_existing_network {
            return Ok(NetworkPlan::SelfContained);
        }
        let backend = &*self.backend;
        let routers = self
            .call("list routers", || async move { backend.list_routers().await })
            .await?;
        let subnets = self
            .call("list subnets", || async move { backend.list_subnets().await })
            .await?;
        let networks = self
            .call("list networks", || async move { backend.list_networks().await })
            .await?;

        let ([router], [subnet], 2) = (routers.as_slice(), subnets.as_slice(), networks.len()) else {
            info!(
                routers = routers.len(),
                subnets = subnets.len(),
                networks = networks.len(),
                "no reusable network found, the stack will create one"
            );
            return Ok(NetworkPlan::SelfContained);
        };

        let router_id = router.id.as_str();
        let external = self.config.cloud.external_network_id.as_str();
        self.call("add router gateway", || async move {
            backend.add_gateway_to_router(router_id, external).await
        })
        .await?;
        info!(network = %subnet.network_id, subnet = %subnet.id, "reusing existing network");
        Ok(NetworkPlan::Existing {
            network_id: subnet.network_id.clone(),
            subnet_id: subnet.id.clone(),
        })
    }

    async fn create_stack(&self, template: &HeatTemplate) -> ProvisionResult<StackRef> {
        let backend = &*self.backend;
        let name = self.config.stack_name();
        let name = name.as_str();
        let doc = template.as_value();
        let params = serde_json::json!({});
        let params = &params;
        let stack = self
            .call("create stack", || async move { backend.create_stack(name, doc, params).await })
            .await?;
        info!(stack = %stack.name, id = %stack.id, "stack submitted");
        Ok(stack)
    }

    /// Poll until the stack reports a create terminal state.
    async fn wait_for_stack(&self, stack: &StackRef) -> ProvisionResult<()> {
        let backend = &*self.backend;
        let timing = self.timing();
        let mut poller = Poller::new(
            format!("stack {}", stack.name),
            timing.stack_poll(),
            self.shutdown.clone(),
        )
        .with_deadline(timing.stack_create_timeout());
        loop {
            let current = self
                .call("stack status", || async move { backend.get_stack(stack).await })
                .await?;
            match current.status.as_str() {
                status::CREATE_COMPLETE => {
                    info!(stack = %stack.name, elapsed = ?poller.elapsed(), "stack created");
                    return Ok(());
                }
                status::CREATE_FAILED => {
                    let reason = current.reason.unwrap_or_else(|| "no reason reported".to_string());
                    error!(stack = %stack.name, %reason, "stack creation failed");
                    if let Err(e) = self.cleanup().await {
                        warn!(error = %e, "cleanup after failed stack did not complete");
                    }
                    return Err(ProvisionError::StackFailed {
                        stack: stack.name.clone(),
                        reason,
                    });
                }
                other => debug!(stack = %stack.name, status = other, "waiting for stack"),
            }
            match poller.tick().await {
                Ok(()) => {}
                Err(PollError::DeadlineExceeded { waited, .. }) => {
                    error!(stack = %stack.name, ?waited, "stack creation timed out");
                    return Err(ProvisionError::StackTimeout {
                        stack: stack.name.clone(),
                        waited,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Copy server id, addresses and RAM from the live listing onto nodes.
    ///
    /// Retried as a whole: servers can be listed before their addresses are.
    async fn populate(&self, cluster: &mut Cluster) -> ProvisionResult<()> {
        let backend = &*self.backend;
        let names: Vec<String> = cluster.nodes().iter().map(|n| n.name.clone()).collect();
        let names = &names;

        let assignments = self
            .timing()
            .api_policy()
            .execute("populate nodes", TRANSIENT, || async move {
                let servers = backend.list_servers().await?;
                let mut assignments = Vec::with_capacity(names.len());
                for name in names {
                    let server = find_server(&servers, name)?;
                    let incomplete = |field| ProvisionError::Incomplete {
                        node: name.clone(),
                        field,
                    };
                    let internal = server.internal_ip.clone().ok_or_else(|| incomplete("internal address"))?;
                    let floating = server.floating_ip.clone().ok_or_else(|| incomplete("floating address"))?;
                    let ram = backend.flavor_ram(&server.flavor_id).await?;
                    assignments.push((name.clone(), server.id.clone(), internal, floating, ram));
                }
                Ok::<_, ProvisionError>(assignments)
            })
            .await?;

        for (name, id, internal, floating, ram) in assignments {
            if let Some(node) = cluster.node_mut(&name) {
                debug!(node = %name, server = %id, %internal, %floating, ram, "node populated");
                node.server_id = Some(id);
                node.internal_ip = Some(internal);
                node.floating_ip = Some(floating);
                node.ram = Some(ram);
            }
        }
        Ok(())
    }

    /// Rebuild every server of an existing cluster from its base image.
    ///
    /// All nodes are rebuilt concurrently; every task runs to completion
    /// and failures are reported together.
    pub async fn rebuild(&self, deployment: &mut Deployment) -> ProvisionResult<()> {
        let credentials = &deployment.cluster.credentials;
        if credentials.key_name.is_none() {
            return Err(ConfigError::Missing("cluster.key_name").into());
        }
        if credentials.private_key.is_none() {
            return Err(ConfigError::Missing("cluster.existing_key_path").into());
        }

        let image_id = self.resolve_image().await?;
        let backend = &*self.backend;
        let servers = self
            .call("list servers", || async move { backend.list_servers().await })
            .await?;

        let (credentials, nodes) = deployment.cluster.split_mut();
        let image_id = image_id.as_str();
        let servers = servers.as_slice();
        info!(nodes = nodes.len(), "rebuilding cluster");
        let results = join_all(nodes.iter_mut().map(move |node| async move {
            let name = node.name.clone();
            let result = match find_server(servers, &name) {
                Ok(server) => {
                    node.server_id = Some(server.id.clone());
                    self.rebuild_one(node, credentials, image_id).await
                }
                Err(e) => Err(e),
            };
            (name, result)
        }))
        .await;

        let failures: Vec<(String, ProvisionError)> = results
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();
        if !failures.is_empty() {
            for (node, e) in &failures {
                error!(node = %node, kind = %e.kind(), error = %e, "node rebuild failed");
            }
            return Err(ProvisionError::Rebuilds(failures));
        }

        self.populate(&mut deployment.cluster).await?;
        info!("cluster rebuilt");
        Ok(())
    }

    async fn resolve_image(&self) -> ProvisionResult<String> {
        let backend = &*self.backend;
        let images = self
            .call("list images", || async move { backend.list_images().await })
            .await?;
        let wanted = &self.config.cloud.image;
        images
            .into_iter()
            .find(|i| &i.name == wanted)
            .map(|i| i.id)
            .ok_or_else(|| ConfigError::Invalid(format!("image {wanted} not found")).into())
    }

    /// Rebuild one server, wait for it to come back, then release its
    /// data volume.
    async fn rebuild_one(
        &self,
        node: &mut Node,
        credentials: &SshCredentials,
        image_id: &str,
    ) -> ProvisionResult<()> {
        let backend = &*self.backend;
        let server_id = node.server_id.clone().ok_or_else(|| ProvisionError::Incomplete {
            node: node.name.clone(),
            field: "server",
        })?;
        let id = server_id.as_str();

        info!(node = %node.name, server = %id, "rebuilding from image");
        self.call("rebuild server", || async move { backend.rebuild_server(id, image_id).await })
            .await?;

        let timing = self.timing();
        let mut poller = Poller::new(
            format!("{} rebuild start", node.name),
            timing.server_poll(),
            self.shutdown.clone(),
        )
        .with_deadline(timing.rebuild_transition_timeout());
        loop {
            let server = self
                .call("server status", || async move { backend.get_server(id).await })
                .await?;
            if server.status == status::SERVER_REBUILD {
                break;
            }
            match poller.tick().await {
                Ok(()) => {}
                Err(PollError::DeadlineExceeded { waited, .. }) => {
                    return Err(ProvisionError::RebuildTimeout {
                        node: node.name.clone(),
                        waited,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        let mut poller = Poller::new(format!("{} rebuild", node.name), timing.server_poll(), self.shutdown.clone());
        loop {
            let server = self
                .call("server status", || async move { backend.get_server(id).await })
                .await?;
            match server.status.as_str() {
                status::SERVER_ACTIVE => break,
                status::SERVER_ERROR => {
                    return Err(ProvisionError::ServerError {
                        node: node.name.clone(),
                    });
                }
                other => debug!(node = %node.name, status = other, "waiting for rebuild"),
            }
            poller.tick().await?;
        }
        info!(node = %node.name, "server active after rebuild");

        self.release_volume(node, credentials).await
    }

    /// Force-unmount the data volume so the next converge can format it.
    async fn release_volume(&self, node: &Node, credentials: &SshCredentials) -> ProvisionResult<()> {
        let target = SshTarget::for_node(node, credentials).ok_or_else(|| RemoteError::MissingTarget {
            node: node.name.clone(),
        })?;
        wait_reachable(&*self.executor, &target, &self.timing().ssh_probe_policy()).await?;
        let mount = shell_quote(&self.config.converge.mount_location);
        let script = format!("if df -h | grep {mount}; then sudo umount -f -l {mount}; fi;");
        run_checked(&*self.executor, &target, &script, &mut OutputSink::discard()).await?;
        debug!(node = %node.name, %mount, "data volume released");
        Ok(())
    }

    async fn rebuild_by_name(&self, node: &mut Node, credentials: &SshCredentials) -> ProvisionResult<()> {
        let image_id = self.resolve_image().await?;
        if node.server_id.is_none() {
            let backend = &*self.backend;
            let servers = self
                .call("list servers", || async move { backend.list_servers().await })
                .await?;
            node.server_id = Some(find_server(&servers, &node.name)?.id.clone());
        }
        self.rebuild_one(node, credentials, &image_id).await
    }
}

fn find_server<'a>(servers: &'a [ServerInfo], name: &str) -> ProvisionResult<&'a ServerInfo> {
    servers
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| ProvisionError::ServerMissing {
            node: name.to_string(),
        })
}

#[async_trait]
impl NodeRebuilder for ResourceProvisioner {
    async fn rebuild_node(&self, node: &mut Node, credentials: &SshCredentials) -> Result<(), RebuildError> {
        let result = self.rebuild_by_name(node, credentials).await;
        result.map_err(|e| RebuildError::new(&node.name, &e))
    }
}
