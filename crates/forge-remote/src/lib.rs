//! forge-remote — reachability probes and remote command execution.
//!
//! Orchestration code depends on the `RemoteExecutor` trait only.
//! `OpenSshExecutor` drives the system `ssh`/`knife` binaries;
//! `ScriptedExecutor` replays programmed outcomes under test.

pub mod command;
pub mod error;
pub mod scripted;
pub mod ssh;

use async_trait::async_trait;
use forge_core::{ErrorKind, RetryPolicy, SshTarget};
use tracing::{error, info};

pub use command::{CommandOutput, OutputSink, RemoteCommand, Stream, shell_quote};
pub use error::{RemoteError, RemoteResult};
pub use scripted::ScriptedExecutor;
pub use ssh::OpenSshExecutor;

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// One connection attempt. `Ok(false)` means "not yet".
    async fn probe(&self, target: &SshTarget) -> RemoteResult<bool>;

    /// Run `command`, streaming its output into `sink`.
    ///
    /// A non-zero exit is reported through `CommandOutput::exit_code`,
    /// not as an error.
    async fn exec(
        &self,
        target: &SshTarget,
        command: &RemoteCommand,
        sink: &mut OutputSink,
    ) -> RemoteResult<CommandOutput>;
}

/// Probe until the node answers or the policy's attempts are spent.
pub async fn wait_reachable(
    executor: &dyn RemoteExecutor,
    target: &SshTarget,
    policy: &RetryPolicy,
) -> RemoteResult<()> {
    let result = policy
        .execute("ssh probe", &[ErrorKind::Connection], || async move {
            if executor.probe(target).await? {
                Ok(())
            } else {
                Err(RemoteError::NotReachable {
                    node: target.node.clone(),
                    address: target.address.clone(),
                })
            }
        })
        .await;

    match result {
        Ok(()) => {
            info!(node = %target.node, "{}@{} reachable", target.user, target.address);
            Ok(())
        }
        Err(RemoteError::NotReachable { node, address }) => {
            error!(node = %node, address = %address, "timed out establishing ssh connection");
            Err(RemoteError::Unreachable {
                node,
                address,
                attempts: policy.max_attempts.max(1),
            })
        }
        Err(other) => Err(other),
    }
}

/// Run a shell command and turn a non-zero exit into `RemoteError::Failed`.
pub async fn run_checked(
    executor: &dyn RemoteExecutor,
    target: &SshTarget,
    script: &str,
    sink: &mut OutputSink,
) -> RemoteResult<CommandOutput> {
    let output = executor.exec(target, &RemoteCommand::shell(script), sink).await?;
    if output.is_success() {
        Ok(output)
    } else {
        Err(RemoteError::Failed {
            node: target.node.clone(),
            command: script.to_string(),
            exit_code: output.exit_code,
            stderr_tail: output.stderr_tail(20),
        })
    }
}
