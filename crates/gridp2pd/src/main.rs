//! gridp2pd — the gridp2p node daemon.
//!
//! Assembles one node's deployment stack:
//! - Node-local store and resource lifecycle manager
//! - Loading-unit cache over a directory-backed fetcher
//! - Execution binder and membership handler
//!
//! # Usage
//!
//! ```text
//! gridp2pd init --node-id node-1 --mode shared
//! gridp2pd run --config gridp2p.toml --resources ./peers \
//!     --origin node-2 --class Task --version v1 --jobs 4
//! ```

mod run;

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::info;

use gridp2p_core::{DeploymentMode, NodeConfig};

#[derive(Parser)]
#[command(name = "gridp2pd", about = "gridp2p node daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a scaffold node configuration.
    Init {
        /// Identifier of this node in the grid.
        #[arg(long)]
        node_id: String,

        /// Deployment mode: private, isolated, shared or continuous.
        #[arg(long, default_value = "shared")]
        mode: DeploymentMode,

        /// Where to write the configuration.
        #[arg(long, default_value = "gridp2p.toml")]
        out: PathBuf,
    },

    /// Resolve and execute a task submission, then print a JSON report.
    Run {
        /// Node configuration file.
        #[arg(long, default_value = "gridp2p.toml")]
        config: PathBuf,

        /// Directory holding `<node id>/<resource>` trees for origin nodes.
        #[arg(long)]
        resources: PathBuf,

        /// Node the task was deployed from.
        #[arg(long)]
        origin: String,

        /// Task class identifier.
        #[arg(long)]
        class: String,

        /// User version of the deployment.
        #[arg(long)]
        version: String,

        /// Jobs to split each task into.
        #[arg(long, default_value = "1")]
        jobs: usize,

        /// Number of times the task is submitted.
        #[arg(long, default_value = "1")]
        repeat: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Init { node_id, mode, out } => init_config(&node_id, mode, &out),
        Command::Run {
            config,
            resources,
            origin,
            class,
            version,
            jobs,
            repeat,
        } => {
            let request = run::RunRequest {
                config: NodeConfig::from_file(&config)?,
                resources,
                origin,
                class,
                version,
                jobs,
                repeat,
            };
            let report = run::execute(request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gridp2pd=debug,gridp2p=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn init_config(node_id: &str, mode: DeploymentMode, out: &Path) -> anyhow::Result<()> {
    if out.exists() {
        anyhow::bail!("{} already exists", out.display());
    }
    let config = NodeConfig::scaffold(node_id, mode);
    std::fs::write(out, config.to_toml_string()?)?;
    info!(path = %out.display(), %node_id, %mode, "node configuration written");
    Ok(())
}
