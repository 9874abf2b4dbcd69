//! forge — deploy StackForge clusters onto an OpenStack project.
//!
//! # Usage
//!
//! ```text
//! forge --config forge.toml deploy
//! forge --config forge.toml converge --runlist restart-hdfs --nodes worker1,worker2
//! forge --config forge.toml install --snapshot cluster.json
//! forge --config forge.toml template --out template.json
//! forge --config forge.toml cleanup
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use forge_core::Shutdown;
use tracing::warn;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "forge",
    about = "StackForge — provision, converge and install data-platform clusters",
    version,
    propagate_version = true
)]
struct Cli {
    /// Deployment settings.
    #[arg(short, long, global = true, default_value = "forge.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Provision, converge and install a cluster end to end.
    Deploy,
    /// Converge an existing cluster from its saved snapshot.
    Converge {
        /// Snapshot to load (default: paths.snapshot).
        #[arg(long)]
        snapshot: Option<PathBuf>,
        /// Run this runlist instead of each node's role.
        #[arg(long, requires = "nodes")]
        runlist: Option<String>,
        /// Nodes to converge, comma separated.
        #[arg(long, value_delimiter = ',')]
        nodes: Option<Vec<String>>,
    },
    /// Install cluster services on an already converged cluster.
    Install {
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
    /// Render the infrastructure template without touching the cloud.
    Template {
        /// Write here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Delete the deployment stack and verify the project is empty.
    Cleanup,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let (shutdown_tx, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping at the next checkpoint");
            let _ = shutdown_tx.send(true);
        }
    });

    match cli.command {
        Command::Deploy => commands::deploy(&cli.config, shutdown).await,
        Command::Converge {
            snapshot,
            runlist,
            nodes,
        } => commands::converge(&cli.config, snapshot.as_deref(), runlist, nodes, shutdown).await,
        Command::Install { snapshot } => commands::install(&cli.config, snapshot.as_deref(), shutdown).await,
        Command::Template { out } => commands::template(&cli.config, out.as_deref()),
        Command::Cleanup => commands::cleanup(&cli.config, shutdown).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,forge=debug"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converge_accepts_runlist_with_nodes() {
        let cli = Cli::try_parse_from([
            "forge",
            "--config",
            "site.toml",
            "converge",
            "--runlist",
            "restart-hdfs",
            "--nodes",
            "worker1,worker2",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("site.toml"));
        match cli.command {
            Command::Converge { runlist, nodes, .. } => {
                assert_eq!(runlist.as_deref(), Some("restart-hdfs"));
                assert_eq!(nodes, Some(vec!["worker1".to_string(), "worker2".to_string()]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn runlist_without_nodes_is_rejected() {
        assert!(Cli::try_parse_from(["forge", "converge", "--runlist", "x"]).is_err());
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["forge", "deploy", "--log-json"]).unwrap();
        assert!(cli.log_json);
        assert_eq!(cli.config, PathBuf::from("forge.toml"));
    }
}
