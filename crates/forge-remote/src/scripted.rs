//! In-process executor whose outcomes are set by the caller.

use std::sync::Mutex;

use async_trait::async_trait;
use forge_core::SshTarget;

use crate::command::{CommandOutput, OutputSink, RemoteCommand, Stream};
use crate::error::RemoteResult;
use crate::RemoteExecutor;

pub type ProbeFn = dyn Fn(&SshTarget) -> bool + Send + Sync;
pub type ExecFn = dyn Fn(&SshTarget, &RemoteCommand) -> CommandOutput + Send + Sync;

/// One recorded `exec` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub node: String,
    pub address: String,
    pub command: RemoteCommand,
}

/// Every node is reachable and every command succeeds until told otherwise.
pub struct ScriptedExecutor {
    probe: Mutex<Box<ProbeFn>>,
    exec: Mutex<Box<ExecFn>>,
    calls: Mutex<Vec<ExecCall>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ScriptedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedExecutor").finish_non_exhaustive()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            probe: Mutex::new(Box::new(|_| true)),
            exec: Mutex::new(Box::new(|_, _| CommandOutput::success(""))),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_probe(&self, f: impl Fn(&SshTarget) -> bool + Send + Sync + 'static) {
        *self.probe.lock().unwrap_or_else(|e| e.into_inner()) = Box::new(f);
    }

    pub fn set_exec(
        &self,
        f: impl Fn(&SshTarget, &RemoteCommand) -> CommandOutput + Send + Sync + 'static,
    ) {
        *self.exec.lock().unwrap_or_else(|e| e.into_inner()) = Box::new(f);
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls made against `node` that match `pred`.
    pub fn count(&self, node: &str, pred: impl Fn(&RemoteCommand) -> bool) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.node == node && pred(&c.command))
            .count()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn probe(&self, target: &SshTarget) -> RemoteResult<bool> {
        let probe = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        Ok(probe(target))
    }

    async fn exec(
        &self,
        target: &SshTarget,
        command: &RemoteCommand,
        sink: &mut OutputSink,
    ) -> RemoteResult<CommandOutput> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ExecCall {
                node: target.node.clone(),
                address: target.address.clone(),
                command: command.clone(),
            });
        let output = {
            let exec = self.exec.lock().unwrap_or_else(|e| e.into_inner());
            exec(target, command)
        };
        for line in output.stdout.lines() {
            sink.line(Stream::Stdout, line).await?;
        }
        for line in output.stderr.lines() {
            sink.line(Stream::Stderr, line).await?;
        }
        sink.flush().await?;
        Ok(output)
    }
}
