//! `RemoteExecutor` backed by the system `ssh` and `knife` binaries.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use forge_core::SshTarget;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::command::{CommandOutput, OutputSink, RemoteCommand, Stream};
use crate::error::{RemoteError, RemoteResult};
use crate::RemoteExecutor;

/// Drives nodes through OpenSSH. Host keys are not checked: nodes are
/// freshly booted and rebuilt in place, so their keys change.
#[derive(Debug, Clone)]
pub struct OpenSshExecutor {
    connect_timeout: Duration,
    /// Upper bound for a single shell command. Converge runs are unbounded.
    command_timeout: Option<Duration>,
}

impl OpenSshExecutor {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout: None,
        }
    }

    /// Bound shell commands by `timeout`; zero leaves them unbounded.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    fn ssh_options(&self) -> Vec<String> {
        vec![
            "-o".into(),
            "BatchMode=yes".into(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ]
    }

    fn ssh(&self, target: &SshTarget) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.args(self.ssh_options())
            .arg("-i")
            .arg(&target.key_path)
            .arg(format!("{}@{}", target.user, target.address));
        cmd
    }

    fn command_for(&self, target: &SshTarget, command: &RemoteCommand) -> Command {
        match command {
            RemoteCommand::Shell(script) => {
                let mut cmd = self.ssh(target);
                // sudo on the images requires a tty. The pty merges the
                // remote stderr into stdout.
                cmd.arg("-tt").arg(script);
                cmd
            }
            RemoteCommand::Converge {
                runlist,
                workspace,
                keepalive_secs,
            } => {
                let mut cmd = Command::new("knife");
                cmd.current_dir(workspace)
                    .args(["solo", "cook", "-i"])
                    .arg(&target.key_path)
                    .arg(format!("{}@{}", target.user, target.address))
                    .arg(format!("runlists/{runlist}"))
                    .arg("--no-berkshelf")
                    .arg("--ssh-keepalive-interval")
                    .arg(keepalive_secs.to_string());
                cmd
            }
        }
    }
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn probe(&self, target: &SshTarget) -> RemoteResult<bool> {
        let mut cmd = self.ssh(target);
        cmd.arg("true")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let status = cmd.status().await.map_err(|source| RemoteError::Spawn {
            program: "ssh".to_string(),
            source,
        })?;
        debug!(node = %target.node, address = %target.address, ok = status.success(), "ssh probe");
        Ok(status.success())
    }

    async fn exec(
        &self,
        target: &SshTarget,
        command: &RemoteCommand,
        sink: &mut OutputSink,
    ) -> RemoteResult<CommandOutput> {
        debug!(node = %target.node, command = %command.label(), "running remote command");
        let cmd = self.command_for(target, command);
        let limit = match command {
            RemoteCommand::Shell(_) => self.command_timeout,
            RemoteCommand::Converge { .. } => None,
        };
        run_bounded(cmd, sink, limit, &target.node).await
    }
}

/// `stream_process` with an optional deadline. The child is killed when
/// the deadline passes.
async fn run_bounded(
    cmd: Command,
    sink: &mut OutputSink,
    limit: Option<Duration>,
    node: &str,
) -> RemoteResult<CommandOutput> {
    let Some(limit) = limit else {
        return stream_process(cmd, sink).await;
    };
    tokio::time::timeout(limit, stream_process(cmd, sink))
        .await
        .map_err(|_| RemoteError::Timeout {
            node: node.to_string(),
            after: limit,
        })?
}

/// Run a process to completion, forwarding every line to `sink` as it arrives.
async fn stream_process(mut cmd: Command, sink: &mut OutputSink) -> RemoteResult<CommandOutput> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    let spawn_err = |source| RemoteError::Spawn {
        program: program.clone(),
        source,
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn().map_err(spawn_err)?;

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return Err(spawn_err(std::io::Error::other("output pipes unavailable")));
    };
    let mut out_lines = BufReader::new(stdout).lines();
    let mut err_lines = BufReader::new(stderr).lines();
    let mut output = CommandOutput::default();
    let (mut out_open, mut err_open) = (true, true);

    while out_open || err_open {
        tokio::select! {
            line = out_lines.next_line(), if out_open => match line {
                Ok(Some(line)) => {
                    sink.line(Stream::Stdout, &line).await?;
                    output.stdout.push_str(&line);
                    output.stdout.push('\n');
                }
                _ => out_open = false,
            },
            line = err_lines.next_line(), if err_open => match line {
                Ok(Some(line)) => {
                    sink.line(Stream::Stderr, &line).await?;
                    output.stderr.push_str(&line);
                    output.stderr.push('\n');
                }
                _ => err_open = false,
            },
        }
    }

    let status = child.wait().await.map_err(spawn_err)?;
    sink.flush().await?;
    output.exit_code = status.code();
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target() -> SshTarget {
        SshTarget {
            node: "worker1".to_string(),
            address: "203.0.113.5".to_string(),
            user: "centos".to_string(),
            key_path: PathBuf::from("/deploy/key"),
        }
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn converge_invokes_knife_solo_from_workspace() {
        let exec = OpenSshExecutor::new(Duration::from_secs(30));
        let cmd = exec.command_for(
            &target(),
            &RemoteCommand::Converge {
                runlist: "worker.json".to_string(),
                workspace: PathBuf::from("/deploy"),
                keepalive_secs: 30,
            },
        );
        assert_eq!(cmd.as_std().get_program(), "knife");
        assert_eq!(
            args(&cmd).join(" "),
            "solo cook -i /deploy/key centos@203.0.113.5 runlists/worker.json --no-berkshelf --ssh-keepalive-interval 30"
        );
        assert_eq!(cmd.as_std().get_current_dir(), Some(std::path::Path::new("/deploy")));
    }

    #[test]
    fn shell_runs_over_ssh_with_tty() {
        let exec = OpenSshExecutor::new(Duration::from_secs(30));
        let cmd = exec.command_for(&target(), &RemoteCommand::shell("sudo umount -f -l /grid/0"));
        let args = args(&cmd);
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(args.contains(&"centos@203.0.113.5".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("sudo umount -f -l /grid/0"));
    }

    #[test]
    fn zero_command_timeout_is_unbounded() {
        let exec = OpenSshExecutor::new(Duration::from_secs(30)).with_command_timeout(Duration::ZERO);
        assert_eq!(exec.command_timeout, None);
        let exec = exec.with_command_timeout(Duration::from_secs(600));
        assert_eq!(exec.command_timeout, Some(Duration::from_secs(600)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_command_hits_the_deadline() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 5"]);
        let mut sink = OutputSink::discard();
        let err = run_bounded(cmd, &mut sink, Some(Duration::from_millis(100)), "worker1")
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { ref node, .. } if node == "worker1"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_both_pipes_and_reports_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out1; echo err1 >&2; echo out2; exit 3"]);
        let mut sink = OutputSink::discard();
        let out = stream_process(cmd, &mut sink).await.unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout, "out1\nout2\n");
        assert_eq!(out.stderr, "err1\n");
    }
}
