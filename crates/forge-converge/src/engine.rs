//! Concurrent per-node convergence.
//!
//! Every selected node gets its own task; all tasks are joined before the
//! phase ends. A fatal failure on one node raises a shared abort signal
//! that the others observe between attempts, so no task is cut off in the
//! middle of a remote command.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use forge_core::{
    Deployment, DeployConfig, Node, NodeRebuilder, Shutdown, SshCredentials, SshTarget, Workspace,
};
use forge_remote::{OutputSink, RemoteCommand, RemoteError, RemoteExecutor, shell_quote, wait_reachable};
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::attributes::write_runtime_recipe;
use crate::error::{ConvergeError, ConvergeResult, NodeFailure};

/// What to converge and where.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeRequest {
    /// Explicit runlist. `None` runs each node's own role.
    pub runlist: Option<String>,
    /// Node subset. `None` selects every node.
    pub nodes: Option<Vec<String>>,
}

impl ConvergeRequest {
    /// Every node with its own role, agent install and rebuild enabled.
    pub fn full() -> Self {
        Self::default()
    }

    /// One runlist on a subset of nodes; no agent install, no rebuild.
    pub fn custom(runlist: impl Into<String>, nodes: Vec<String>) -> Self {
        Self {
            runlist: Some(runlist.into()),
            nodes: Some(nodes),
        }
    }
}

/// Nodes that converged, with the attempt that succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergeReport {
    pub converged: Vec<(String, u32)>,
}

pub struct ConvergenceEngine {
    executor: Arc<dyn RemoteExecutor>,
    rebuilder: Option<Arc<dyn NodeRebuilder>>,
    shutdown: Shutdown,
}

impl std::fmt::Debug for ConvergenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvergenceEngine")
            .field("rebuild_on_failure", &self.rebuilder.is_some())
            .finish_non_exhaustive()
    }
}

/// Per-run settings shared by every node task.
struct Run<'a> {
    executor: &'a dyn RemoteExecutor,
    rebuilder: Option<&'a dyn NodeRebuilder>,
    config: &'a DeployConfig,
    workspace: &'a Workspace,
    credentials: &'a SshCredentials,
    runlist: Option<&'a str>,
    install_agent: bool,
    abort: &'a watch::Sender<bool>,
    shutdown: &'a Shutdown,
    remaining: &'a AtomicUsize,
}

impl ConvergenceEngine {
    pub fn new(executor: Arc<dyn RemoteExecutor>, shutdown: Shutdown) -> Self {
        Self {
            executor,
            rebuilder: None,
            shutdown,
        }
    }

    /// Rebuild a node in place before retrying a failed full converge.
    pub fn with_rebuilder(mut self, rebuilder: Arc<dyn NodeRebuilder>) -> Self {
        self.rebuilder = Some(rebuilder);
        self
    }

    pub async fn converge(
        &self,
        deployment: &mut Deployment,
        request: &ConvergeRequest,
    ) -> ConvergeResult<ConvergeReport> {
        self.shutdown.check()?;
        if let Some(names) = &request.nodes {
            if let Some(unknown) = names.iter().find(|n| deployment.cluster.node(n).is_none()) {
                return Err(ConvergeError::UnknownNode(unknown.clone()));
            }
        }
        if request.runlist.is_none() {
            write_runtime_recipe(deployment)?;
        }

        let Deployment {
            cluster,
            config,
            workspace,
            ..
        } = deployment;
        let (credentials, nodes) = cluster.split_mut();
        let (abort, _abort_rx) = watch::channel(false);
        let selected: Vec<&mut Node> = nodes
            .iter_mut()
            .filter(|node| {
                request
                    .nodes
                    .as_ref()
                    .is_none_or(|names| names.iter().any(|n| *n == node.name))
            })
            .collect();
        let remaining = AtomicUsize::new(selected.len());
        let status_every = config.timing.converge_status();
        let run = Run {
            executor: &*self.executor,
            rebuilder: match request.runlist {
                None => self.rebuilder.as_deref(),
                Some(_) => None,
            },
            config,
            workspace,
            credentials,
            runlist: request.runlist.as_deref(),
            install_agent: request.runlist.is_none(),
            abort: &abort,
            shutdown: &self.shutdown,
            remaining: &remaining,
        };
        let run = &run;

        info!(
            runlist = request.runlist.as_deref().unwrap_or("<roles>"),
            nodes = selected.len(),
            "converging nodes"
        );
        let tasks = join_all(selected.into_iter().map(move |node| run.converge_node(node)));
        let (results, _) = with_heartbeat(tasks, &remaining, status_every).await;

        let mut report = ConvergeReport::default();
        let mut failures = Vec::new();
        let mut aborted = Vec::new();
        for (name, result) in results {
            match result {
                Ok(Some(attempt)) => report.converged.push((name, attempt)),
                Ok(None) => aborted.push(name),
                Err(e) => failures.push((name, e)),
            }
        }

        if !failures.is_empty() {
            return Err(ConvergeError::Nodes { failures, aborted });
        }
        if !aborted.is_empty() {
            self.shutdown.check()?;
        }
        info!(nodes = report.converged.len(), "nodes converged");
        Ok(report)
    }
}

/// Drive `work` to completion, logging how many nodes are still running
/// every `every`. Returns the output and the number of reports made.
async fn with_heartbeat<F: Future>(
    work: F,
    remaining: &AtomicUsize,
    every: Duration,
) -> (F::Output, u32) {
    if every.is_zero() {
        return (work.await, 0);
    }
    let mut work = std::pin::pin!(work);
    let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut reports = 0;
    loop {
        tokio::select! {
            output = &mut work => return (output, reports),
            _ = heartbeat.tick() => {
                reports += 1;
                info!(remaining = remaining.load(Ordering::Relaxed), "still converging");
            }
        }
    }
}

impl Run<'_> {
    async fn converge_node(&self, node: &mut Node) -> (String, Result<Option<u32>, NodeFailure>) {
        let name = node.name.clone();
        let result = self.attempts(node).await;
        self.remaining.fetch_sub(1, Ordering::Relaxed);
        if let Err(e) = &result {
            error!(node = %name, error = %e, "convergence failed");
            if e.aborts_run() {
                self.abort.send_replace(true);
            }
        }
        (name, result)
    }

    fn stopped(&self) -> bool {
        *self.abort.borrow() || self.shutdown.is_cancelled()
    }

    fn target(&self, node: &Node) -> Result<SshTarget, RemoteError> {
        SshTarget::for_node(node, self.credentials).ok_or_else(|| RemoteError::MissingTarget {
            node: node.name.clone(),
        })
    }

    /// `Ok(None)` when the run was aborted before this node finished.
    async fn attempts(&self, node: &mut Node) -> Result<Option<u32>, NodeFailure> {
        let converge = &self.config.converge;
        let runlist = match self.runlist {
            Some(r) => r.to_string(),
            None => format!("{}.json", node.role),
        };
        let tries = converge.tries.max(1);

        let mut target = self.target(node)?;
        wait_reachable(self.executor, &target, &self.config.timing.ssh_probe_policy()).await?;

        let mut attempt = 0;
        loop {
            if self.stopped() {
                warn!(node = %node.name, "stopping, another node failed");
                return Ok(None);
            }
            attempt += 1;

            if self.install_agent {
                self.install_agent(node, &target).await?;
            }

            info!(node = %node.name, %runlist, attempt, "executing runlist");
            let header = format!("\n <<<<< Converging {} - {runlist} >>>>> ", node.name);
            let mut sink = OutputSink::create(&self.workspace.converge_log(&node.name), &header).await?;
            if node.primary && converge.log_primary_output {
                sink = sink.echo_as(&node.name);
            }
            let command = RemoteCommand::Converge {
                runlist: runlist.clone(),
                workspace: self.workspace.root().to_path_buf(),
                keepalive_secs: converge.keepalive_interval_secs,
            };
            let output = self.executor.exec(&target, &command, &mut sink).await?;

            if output.is_success() {
                info!(node = %node.name, %runlist, address = %target.address, "runlist succeeded");
                return Ok(Some(attempt));
            }
            for line in output.stderr.lines() {
                error!(target: "forge::chef", node = %node.name, "{line}");
            }
            warn!(node = %node.name, %runlist, attempt, exit_code = ?output.exit_code, "runlist failed");

            if attempt >= tries {
                return Err(NodeFailure::Exhausted {
                    node: node.name.clone(),
                    runlist,
                    attempts: attempt,
                    stderr_tail: output.stderr_tail(20),
                });
            }
            if let Some(rebuilder) = self.rebuilder {
                if self.stopped() {
                    return Ok(None);
                }
                warn!(node = %node.name, "rebuilding node before retry");
                rebuilder.rebuild_node(node, self.credentials).await?;
                target = self.target(node)?;
            }
            warn!(node = %node.name, remaining = tries - attempt, "retrying runlist");
        }
    }

    /// Install the agent unless a package is already present.
    async fn install_agent(&self, node: &Node, target: &SshTarget) -> Result<(), NodeFailure> {
        let script = format!(
            "curl {} > /tmp/chef.rpm; rpm -qa | grep chef || sudo rpm -i /tmp/chef.rpm",
            shell_quote(&self.config.converge.agent_package_uri)
        );
        let mut sink = OutputSink::append(&self.workspace.agent_log(&node.name)).await?;
        if node.primary && self.config.converge.log_primary_output {
            sink = sink.echo_as(&node.name);
        }
        let output = self
            .executor
            .exec(target, &RemoteCommand::shell(script), &mut sink)
            .await?;
        if output.is_success() {
            info!(node = %node.name, "agent installed");
            Ok(())
        } else {
            Err(NodeFailure::AgentInstall {
                node: node.name.clone(),
                exit_code: output.exit_code,
                stderr_tail: output.stderr_tail(20),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use forge_core::testing::{sample_config, three_node_template};
    use forge_core::{Classify, ErrorKind, Payloads, RebuildError, Timing};
    use forge_remote::{CommandOutput, ScriptedExecutor};
    use std::sync::Mutex;

    fn deployment(dir: &std::path::Path) -> Deployment {
        let mut config = sample_config(dir).unwrap();
        config.timing = Timing::immediate();
        let mut cluster = Deployment::fresh_cluster(&config, &three_node_template()).unwrap();
        cluster.credentials.private_key = Some(dir.join("key"));
        for (i, node) in cluster.nodes_mut().iter_mut().enumerate() {
            node.floating_ip = Some(format!("203.0.113.{}", i + 10));
            node.internal_ip = Some(format!("10.0.0.{}", i + 10));
        }
        let workspace = Workspace::create(&config.paths.deployment_base, "analytics-1").unwrap();
        Deployment::new(config, cluster, workspace, Payloads::default())
    }

    fn is_converge(c: &RemoteCommand) -> bool {
        matches!(c, RemoteCommand::Converge { .. })
    }

    fn is_agent_install(c: &RemoteCommand) -> bool {
        matches!(c, RemoteCommand::Shell(s) if s.contains("rpm -i"))
    }

    #[derive(Default)]
    struct CountingRebuilder {
        rebuilt: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NodeRebuilder for CountingRebuilder {
        async fn rebuild_node(&self, node: &mut Node, _: &SshCredentials) -> Result<(), RebuildError> {
            self.rebuilt.lock().unwrap().push(node.name.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_converge_uses_roles_and_writes_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());
        let engine = ConvergenceEngine::new(executor.clone(), Shutdown::never());

        let report = engine.converge(&mut d, &ConvergeRequest::full()).await.unwrap();
        assert_eq!(report.converged.len(), 3);
        assert!(report.converged.iter().all(|(_, attempt)| *attempt == 1));

        let runlists: Vec<String> = executor
            .calls()
            .into_iter()
            .filter_map(|c| match c.command {
                RemoteCommand::Converge { runlist, .. } => Some(runlist),
                _ => None,
            })
            .collect();
        assert_eq!(runlists.iter().filter(|r| *r == "worker.json").count(), 2);
        assert!(runlists.contains(&"master.json".to_string()));
        assert_eq!(executor.count("master", is_agent_install), 1);
        assert!(d.workspace.recipe_path("stackforge").exists());
        let log = std::fs::read_to_string(d.workspace.converge_log("worker2")).unwrap();
        assert!(log.contains("<<<<< Converging worker2 - worker.json >>>>>"));
    }

    #[tokio::test]
    async fn exhausted_retries_without_rebuild_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_exec(|target, command| match command {
            RemoteCommand::Converge { .. } if target.node == "worker2" => {
                CommandOutput::failure(1, "Chef::Exceptions::Exec: mkfs failed")
            }
            _ => CommandOutput::success("ok"),
        });
        let engine = ConvergenceEngine::new(executor.clone(), Shutdown::never());

        let err = engine.converge(&mut d, &ConvergeRequest::full()).await.unwrap_err();
        assert_eq!(executor.count("worker2", is_converge), 3);
        assert_eq!(err.kind(), ErrorKind::RemoteExecution);
        assert_eq!(err.node(), Some("worker2"));
        match err {
            ConvergeError::Nodes { failures, .. } => match &failures[0].1 {
                NodeFailure::Exhausted { attempts, stderr_tail, .. } => {
                    assert_eq!(*attempts, 3);
                    assert!(stderr_tail.contains("mkfs failed"));
                }
                other => panic!("unexpected {other:?}"),
            },
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_node_is_rebuilt_before_retry() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());
        let converges = Arc::new(Mutex::new(0u32));
        let seen = converges.clone();
        executor.set_exec(move |target, command| {
            if target.node == "worker1" && is_converge(command) {
                let mut n = seen.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    return CommandOutput::failure(1, "converge failed");
                }
            }
            CommandOutput::success("")
        });
        let rebuilder = Arc::new(CountingRebuilder::default());
        let engine = ConvergenceEngine::new(executor.clone(), Shutdown::never()).with_rebuilder(rebuilder.clone());

        let report = engine.converge(&mut d, &ConvergeRequest::full()).await.unwrap();
        assert!(report.converged.contains(&("worker1".to_string(), 3)));
        assert_eq!(*rebuilder.rebuilt.lock().unwrap(), ["worker1", "worker1"]);
        // The agent is reinstalled on every attempt.
        assert_eq!(executor.count("worker1", is_agent_install), 3);
    }

    #[tokio::test]
    async fn custom_runlist_targets_subset_without_install_or_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_exec(|_, command| {
            if is_converge(command) {
                CommandOutput::failure(2, "boom")
            } else {
                CommandOutput::success("")
            }
        });
        let rebuilder = Arc::new(CountingRebuilder::default());
        let engine = ConvergenceEngine::new(executor.clone(), Shutdown::never()).with_rebuilder(rebuilder.clone());
        let request = ConvergeRequest::custom("restart-hdfs", vec!["worker1".to_string()]);

        let err = engine.converge(&mut d, &request).await.unwrap_err();
        assert_eq!(err.node(), Some("worker1"));
        assert_eq!(executor.count("worker1", is_converge), 3);
        assert_eq!(executor.count("master", |_| true), 0);
        assert_eq!(executor.count("worker1", is_agent_install), 0);
        assert!(rebuilder.rebuilt.lock().unwrap().is_empty());
        assert!(!d.workspace.recipe_path("stackforge").exists());
    }

    #[tokio::test]
    async fn agent_install_failure_stops_the_node() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_exec(|target, command| {
            if target.node == "worker1" && is_agent_install(command) {
                CommandOutput::failure(1, "curl: (6) Could not resolve host")
            } else {
                CommandOutput::success("")
            }
        });
        let engine = ConvergenceEngine::new(executor.clone(), Shutdown::never());

        let err = engine.converge(&mut d, &ConvergeRequest::full()).await.unwrap_err();
        let ConvergeError::Nodes { failures, .. } = &err else {
            panic!("unexpected {err:?}");
        };
        assert!(matches!(failures[0].1, NodeFailure::AgentInstall { .. }));
        assert_eq!(executor.count("worker1", is_converge), 0);
    }

    #[tokio::test]
    async fn unreachable_node_fails_without_running_commands() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        let executor = Arc::new(ScriptedExecutor::new());
        executor.set_probe(|target| target.node != "master");
        let engine = ConvergenceEngine::new(executor.clone(), Shutdown::never());

        let err = engine.converge(&mut d, &ConvergeRequest::full()).await.unwrap_err();
        assert_eq!(err.node(), Some("master"));
        assert_eq!(executor.count("master", |_| true), 0);
        let ConvergeError::Nodes { failures, .. } = err else {
            unreachable!()
        };
        assert!(!failures[0].1.aborts_run());
    }

    #[tokio::test]
    async fn unknown_node_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        let engine = ConvergenceEngine::new(Arc::new(ScriptedExecutor::new()), Shutdown::never());
        let request = ConvergeRequest::custom("x", vec!["edge1".to_string()]);
        let err = engine.converge(&mut d, &request).await.unwrap_err();
        assert!(matches!(err, ConvergeError::UnknownNode(ref n) if n == "edge1"));
    }

    #[tokio::test(start_paused = true)]
    async fn progress_is_reported_while_nodes_run() {
        let remaining = AtomicUsize::new(2);
        let work = async {
            tokio::time::sleep(Duration::from_secs(25)).await;
            remaining.fetch_sub(2, Ordering::Relaxed);
            "done"
        };
        let (output, reports) = with_heartbeat(work, &remaining, Duration::from_secs(10)).await;
        assert_eq!(output, "done");
        assert_eq!(reports, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_status_interval_disables_reports() {
        let remaining = AtomicUsize::new(1);
        let work = tokio::time::sleep(Duration::from_secs(60));
        let ((), reports) = with_heartbeat(work, &remaining, Duration::ZERO).await;
        assert_eq!(reports, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn status_interval_does_not_change_the_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        d.config.timing.converge_status_secs = 10;
        let engine = ConvergenceEngine::new(Arc::new(ScriptedExecutor::new()), Shutdown::never());
        let report = engine.converge(&mut d, &ConvergeRequest::full()).await.unwrap();
        assert_eq!(report.converged.len(), 3);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = deployment(dir.path());
        let (tx, shutdown) = Shutdown::channel();
        tx.send(true).unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let engine = ConvergenceEngine::new(executor.clone(), shutdown);
        let err = engine.converge(&mut d, &ConvergeRequest::full()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(executor.calls().is_empty());
    }
}
