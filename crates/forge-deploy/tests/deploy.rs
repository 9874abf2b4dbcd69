//! End-to-end runs against the in-memory cloud, a scripted executor and a
//! mocked management service.

use std::sync::Arc;

use forge_cloud::FakeCloud;
use forge_converge::ConvergeRequest;
use forge_core::testing::{sample_config, three_node_template};
use forge_core::{Classify, Cluster, ClusterSnapshot, DeployConfig, Deployment, ErrorKind, Payloads, Shutdown, Timing};
use forge_deploy::{DeployError, DeploymentCoordinator, Phase};
use forge_http::Method;
use forge_http::testing::{MockReply, MockTransport};
use forge_remote::{CommandOutput, RemoteCommand, ScriptedExecutor};
use serde_json::json;

struct Harness {
    cloud: Arc<FakeCloud>,
    executor: Arc<ScriptedExecutor>,
    management: Arc<MockTransport>,
    _dir: tempfile::TempDir,
    config: DeployConfig,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sample_config(dir.path()).unwrap();
    config.timing = Timing::immediate();

    let management = Arc::new(MockTransport::new());
    let href = "https://203.0.113.1/api/v1/clusters/analytics-stack/requests/1";
    management
        .on(Method::POST, "/blueprints/analytics-stack", MockReply::Empty)
        .on_json(Method::POST, "/clusters/analytics-stack", json!({ "href": href }))
        .on_json(
            Method::GET,
            "/requests/1",
            json!({ "Requests": { "progress_percent": 40.0, "request_status": "IN_PROGRESS" } }),
        )
        .on_json(
            Method::GET,
            "/requests/1",
            json!({ "Requests": { "progress_percent": 100.0, "request_status": "COMPLETED" } }),
        )
        .on(Method::PUT, "/users/admin", MockReply::Empty);

    Harness {
        cloud: Arc::new(FakeCloud::new()),
        executor: Arc::new(ScriptedExecutor::new()),
        management,
        _dir: dir,
        config,
    }
}

impl Harness {
    fn coordinator(&self, deployment: &Deployment) -> DeploymentCoordinator {
        DeploymentCoordinator::new(self.cloud.clone(), self.executor.clone(), deployment, Shutdown::never())
            .with_management_transport(self.management.clone())
    }

    fn fresh_deployment(&self) -> Deployment {
        let cluster = Deployment::fresh_cluster(&self.config, &three_node_template()).unwrap();
        let payloads = Payloads {
            blueprint: json!({ "Blueprints": { "stack_name": "HDP" } }),
            host_mapping: json!({ "blueprint": "analytics-stack" }),
            ..Payloads::default()
        };
        Deployment::stage(self.config.clone(), cluster, payloads).unwrap()
    }
}

fn is_converge(c: &RemoteCommand) -> bool {
    matches!(c, RemoteCommand::Converge { .. })
}

#[tokio::test]
async fn three_node_deploy_end_to_end() {
    let h = harness();
    let mut deployment = h.fresh_deployment();
    let coordinator = h.coordinator(&deployment);

    let report = coordinator.deploy(&mut deployment).await.unwrap();

    assert_eq!(h.cloud.servers().len(), 3);
    assert_eq!(h.cloud.floating_ips().len(), 3);
    assert_eq!(h.cloud.volumes().len(), 3);
    assert_eq!(h.cloud.networks().len(), 1);
    assert_eq!(h.cloud.subnets().len(), 1);
    assert_eq!(h.cloud.routers().len(), 1);
    assert!(deployment.cluster.nodes().iter().all(|n| n.floating_ip.is_some()));
    assert!(deployment.cluster.nodes().iter().all(|n| n.is_populated()));

    assert_eq!(report.converged.converged.len(), 3);
    for node in ["master", "worker1", "worker2"] {
        assert_eq!(h.executor.count(node, is_converge), 1, "{node}");
    }
    assert_eq!(h.management.count(&Method::GET, "/requests/1"), 2);
    assert_eq!(h.management.count(&Method::PUT, "/users/admin"), 1);

    let master_ip = deployment.cluster.master().floating_ip.clone().unwrap();
    assert_eq!(report.management_url, Some(format!("https://{master_ip}:8443")));

    let saved = ClusterSnapshot::load(&report.snapshot).unwrap();
    assert_eq!(saved.nodes, deployment.cluster.nodes());
    assert_eq!(saved.master_node.name, "master");
}

#[tokio::test]
async fn rebuild_path_reuses_the_saved_cluster() {
    let h = harness();
    let mut first = h.fresh_deployment();
    let report = h.coordinator(&first).deploy(&mut first).await.unwrap();
    h.cloud.add_image("centos-7");

    let cluster = Cluster::try_from(ClusterSnapshot::load(&report.snapshot).unwrap()).unwrap();
    let mut config = h.config.clone();
    config.cloud.use_existing_cluster = true;
    let mut second = Deployment::stage(config, cluster, first.payloads.clone()).unwrap();
    let coordinator = h.coordinator(&second);

    coordinator.deploy(&mut second).await.unwrap();
    assert_eq!(h.cloud.rebuilds().len(), 3);
    assert_eq!(h.cloud.servers().len(), 3);
    assert_eq!(h.cloud.deleted_stacks().len(), 0);
    for node in ["master", "worker1", "worker2"] {
        assert_eq!(h.executor.count(node, is_converge), 2, "{node}");
    }
}

#[tokio::test]
async fn converge_failure_stops_before_install() {
    let h = harness();
    h.cloud.add_image("centos-7");
    h.executor.set_exec(|target, command| {
        if target.node == "worker2" && is_converge(command) {
            CommandOutput::failure(1, "FATAL: Chef::Exceptions::ChildConvergeError")
        } else {
            CommandOutput::success("")
        }
    });
    let mut deployment = h.fresh_deployment();
    let coordinator = h.coordinator(&deployment);

    let err = coordinator.deploy(&mut deployment).await.unwrap_err();
    assert_eq!(err.phase(), Phase::Converge);
    assert_eq!(err.kind(), ErrorKind::RemoteExecution);
    assert_eq!(err.node(), Some("worker2"));
    assert!(err.to_string().contains("ChildConvergeError"));
    // Rebuilt before each retry, not after the last attempt.
    assert_eq!(h.cloud.rebuilds().len(), 2);
    assert_eq!(h.executor.count("worker2", is_converge), 3);
    assert!(h.management.requests().is_empty());
    // Infrastructure stays up for inspection.
    assert_eq!(h.cloud.servers().len(), 3);
    assert!(deployment.snapshot_path().exists());
}

#[tokio::test]
async fn failed_stack_is_a_provision_error() {
    let h = harness();
    h.cloud.fail_after(1, "Quota exceeded for instances");
    let mut deployment = h.fresh_deployment();
    let coordinator = h.coordinator(&deployment);

    let err = coordinator.deploy(&mut deployment).await.unwrap_err();
    assert!(matches!(err, DeployError::Provision(_)));
    assert_eq!(err.kind(), ErrorKind::Provisioning);
    assert!(err.to_string().contains("Quota exceeded"));
    assert!(h.executor.calls().is_empty());
    assert!(!deployment.snapshot_path().exists());
}

#[tokio::test]
async fn targeted_converge_runs_on_selected_nodes() {
    let h = harness();
    let mut deployment = h.fresh_deployment();
    let coordinator = h.coordinator(&deployment);
    coordinator.provision(&mut deployment).await.unwrap();

    let request = ConvergeRequest::custom("restart-services", vec!["worker1".to_string(), "worker2".to_string()]);
    let report = coordinator.converge(&mut deployment, &request).await.unwrap();
    assert_eq!(report.converged.len(), 2);
    assert_eq!(h.executor.count("master", |_| true), 0);
}
