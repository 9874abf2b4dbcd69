//! Commands, their captured output and where streamed lines go.

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::{RemoteError, RemoteResult};

/// Quote `value` for a POSIX shell. Plain words pass through unchanged.
pub fn shell_quote(value: &str) -> Cow<'_, str> {
    let plain = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/_-.:=,@+%".contains(c));
    if plain {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(format!("'{}'", value.replace('\'', r"'\''")))
    }
}

/// Something to run against one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Shell command executed on the node over SSH.
    Shell(String),
    /// Configuration-management run pushed from the local workspace.
    Converge {
        runlist: String,
        workspace: PathBuf,
        keepalive_secs: u64,
    },
}

impl RemoteCommand {
    pub fn shell(cmd: impl Into<String>) -> Self {
        RemoteCommand::Shell(cmd.into())
    }

    /// Short label for logs and error messages.
    pub fn label(&self) -> String {
        match self {
            RemoteCommand::Shell(cmd) => cmd.clone(),
            RemoteCommand::Converge { runlist, .. } => format!("runlist {runlist}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Last `lines` lines of stderr, for error reports. Falls back to
    /// stdout when stderr is empty, since a pty merges both streams.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let all: Vec<&str> = text.lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Which stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Destination for output lines as they are produced.
///
/// Lines go to an optional log file; stdout lines are additionally echoed
/// to the operator log when an echo label is set.
#[derive(Debug, Default)]
pub struct OutputSink {
    file: Option<(PathBuf, tokio::fs::File)>,
    echo: Option<String>,
}

impl OutputSink {
    pub fn discard() -> Self {
        Self::default()
    }

    /// Truncate `path` and start it with `header`.
    pub async fn create(path: &Path, header: &str) -> RemoteResult<Self> {
        let file = tokio::fs::File::create(path).await.map_err(log_err(path))?;
        let mut sink = Self {
            file: Some((path.to_path_buf(), file)),
            echo: None,
        };
        sink.raw(header).await?;
        Ok(sink)
    }

    pub async fn append(path: &Path) -> RemoteResult<Self> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(log_err(path))?;
        Ok(Self {
            file: Some((path.to_path_buf(), file)),
            echo: None,
        })
    }

    /// Echo stdout lines to the operator log, tagged with `node`.
    pub fn echo_as(mut self, node: &str) -> Self {
        self.echo = Some(node.to_string());
        self
    }

    pub async fn line(&mut self, stream: Stream, line: &str) -> RemoteResult<()> {
        if let (Some(node), Stream::Stdout) = (&self.echo, stream) {
            warn!(target: "forge::chef", node = %node, "{line}");
        }
        self.raw(line).await
    }

    async fn raw(&mut self, text: &str) -> RemoteResult<()> {
        if let Some((path, file)) = &mut self.file {
            file.write_all(text.as_bytes()).await.map_err(log_err(path))?;
            file.write_all(b"\n").await.map_err(log_err(path))?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> RemoteResult<()> {
        if let Some((path, file)) = &mut self.file {
            file.flush().await.map_err(log_err(path))?;
        }
        Ok(())
    }
}

fn log_err(path: &Path) -> impl FnOnce(std::io::Error) -> RemoteError + '_ {
    move |source| RemoteError::Log {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_tail_keeps_last_lines() {
        let out = CommandOutput::failure(1, "a\nb\nc\nd");
        assert_eq!(out.stderr_tail(2), "c\nd");
        assert_eq!(out.stderr_tail(10), "a\nb\nc\nd");
        assert!(!out.is_success());
    }

    #[test]
    fn tail_falls_back_to_merged_stdout() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "installing\nmysqladmin: connect to server failed\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(out.stderr_tail(1), "mysqladmin: connect to server failed");
    }

    #[test]
    fn shell_quote_leaves_plain_words() {
        assert_eq!(shell_quote("/grid/0"), "/grid/0");
        assert_eq!(shell_quote("http://repo:8080/chef-12.rpm"), "http://repo:8080/chef-12.rpm");
    }

    #[test]
    fn shell_quote_escapes_metacharacters() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("a b; rm -rf /"), "'a b; rm -rf /'");
        assert_eq!(shell_quote("$(reboot)"), "'$(reboot)'");
        assert_eq!(shell_quote(""), "''");
    }

    #[tokio::test]
    async fn sink_writes_header_and_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master-converge");
        let mut sink = OutputSink::create(&path, "<<<<< Converging master >>>>>")
            .await
            .unwrap()
            .echo_as("master");
        sink.line(Stream::Stdout, "Recipe: stackforge::runtime").await.unwrap();
        sink.line(Stream::Stderr, "WARN: deprecated").await.unwrap();
        sink.flush().await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "<<<<< Converging master >>>>>\nRecipe: stackforge::runtime\nWARN: deprecated\n"
        );
    }
}
