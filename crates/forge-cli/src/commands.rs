use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use forge_cloud::{HeatTemplate, NetworkPlan, OpenStackBackend, ResourceProvisioner, TemplateSettings};
use forge_converge::ConvergeRequest;
use forge_core::{
    Classify, Cluster, ClusterSnapshot, ClusterTemplate, DeployConfig, Deployment, Payloads, Shutdown, Timing,
};
use forge_deploy::{DeployError, DeploymentCoordinator};
use forge_remote::OpenSshExecutor;
use tracing::{error, info};

/// Load settings; a relative template path is taken from the config's directory.
pub fn load_config(path: &Path) -> anyhow::Result<DeployConfig> {
    let mut config = DeployConfig::from_file(path)?;
    if config.cluster.template.is_relative() {
        if let Some(dir) = path.parent() {
            config.cluster.template = dir.join(&config.cluster.template);
        }
    }
    Ok(config)
}

fn load_snapshot(config: &DeployConfig, snapshot: Option<&Path>) -> anyhow::Result<Cluster> {
    let path = snapshot
        .map(Path::to_path_buf)
        .or_else(|| config.paths.snapshot.clone())
        .context("no snapshot given and paths.snapshot is not set")?;
    let snapshot = ClusterSnapshot::load(&path)?;
    info!(snapshot = %path.display(), nodes = snapshot.nodes.len(), "loaded cluster");
    Ok(Cluster::try_from(snapshot)?)
}

fn executor(timing: &Timing) -> OpenSshExecutor {
    OpenSshExecutor::new(timing.ssh_connect_timeout()).with_command_timeout(timing.remote_command_timeout())
}

fn coordinator(deployment: &Deployment, shutdown: Shutdown) -> anyhow::Result<DeploymentCoordinator> {
    let backend = OpenStackBackend::connect(&deployment.config.cloud)?;
    let ssh = executor(&deployment.config.timing);
    Ok(DeploymentCoordinator::new(
        Arc::new(backend),
        Arc::new(ssh),
        deployment,
        shutdown,
    ))
}

/// Log a phase failure with its attribution, then hand it to `main`.
fn report(err: DeployError) -> anyhow::Error {
    error!(
        phase = %err.phase(),
        kind = %err.kind(),
        node = err.node().unwrap_or("-"),
        error = %err,
        "deployment failed"
    );
    err.into()
}

pub async fn deploy(config_path: &Path, shutdown: Shutdown) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let cluster = if config.cloud.use_existing_cluster {
        load_snapshot(&config, None)?
    } else {
        let template = ClusterTemplate::from_file(&config.cluster.template)?;
        Deployment::fresh_cluster(&config, &template)?
    };
    let payloads = Payloads::load(&config.paths.payloads)?;
    let mut deployment = Deployment::stage(config, cluster, payloads)?;

    let coordinator = coordinator(&deployment, shutdown)?;
    let result = coordinator.deploy(&mut deployment).await.map_err(report)?;
    if let Some(url) = &result.management_url {
        println!("{url}");
    }
    Ok(())
}

pub async fn converge(
    config_path: &Path,
    snapshot: Option<&Path>,
    runlist: Option<String>,
    nodes: Option<Vec<String>>,
    shutdown: Shutdown,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let cluster = load_snapshot(&config, snapshot)?;
    let mut deployment = Deployment::stage(config, cluster, Payloads::default())?;
    let request = ConvergeRequest { runlist, nodes };

    let coordinator = coordinator(&deployment, shutdown)?;
    let summary = coordinator.converge(&mut deployment, &request).await.map_err(report)?;
    for (node, attempts) in &summary.converged {
        info!(%node, attempts, "converged");
    }
    Ok(())
}

pub async fn install(config_path: &Path, snapshot: Option<&Path>, shutdown: Shutdown) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let cluster = load_snapshot(&config, snapshot)?;
    let payloads = Payloads::load(&config.paths.payloads)?;
    let deployment = Deployment::stage(config, cluster, payloads)?;

    let coordinator = coordinator(&deployment, shutdown)?;
    coordinator.install(&deployment).await.map_err(report)?;
    if let Some(url) = deployment.management_url() {
        println!("{url}");
    }
    Ok(())
}

/// Render the template a fresh build would submit, with a self-contained network.
pub fn render_template(config: &DeployConfig) -> anyhow::Result<HeatTemplate> {
    let template = ClusterTemplate::from_file(&config.cluster.template)?;
    let nodes = template.expand(&config.cluster.fqdn_suffix)?;
    let key_name = config
        .cluster
        .key_name
        .clone()
        .unwrap_or_else(|| format!("{}-key", config.cluster.name));
    let settings = TemplateSettings::from_config(config, &key_name);
    Ok(HeatTemplate::generate(&settings, &nodes, &NetworkPlan::SelfContained))
}

pub fn template(config_path: &Path, out: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let rendered = render_template(&config)?;
    match out {
        Some(path) => {
            rendered.write(path)?;
            info!(path = %path.display(), "template written");
        }
        None => println!("{}", serde_json::to_string_pretty(rendered.as_value())?),
    }
    Ok(())
}

pub async fn cleanup(config_path: &Path, shutdown: Shutdown) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let backend = OpenStackBackend::connect(&config.cloud)?;
    let ssh = executor(&config.timing);
    let provisioner = ResourceProvisioner::new(Arc::new(backend), Arc::new(ssh), &config, shutdown);
    provisioner.cleanup().await.map_err(|e| report(DeployError::Provision(e)))?;
    info!(stack = %config.stack_name(), "project is clean");
    Ok(())
}
