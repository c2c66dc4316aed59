//! errandd — the errand director daemon.
//!
//! Stores deployment manifests and runs errands against them in a single
//! process:
//! - State store (redb)
//! - Deployment lock
//! - Resource pool accounting
//! - Local cloud + process runner
//!
//! # Usage
//!
//! ```text
//! errandd --data-dir /var/lib/errandd deploy --manifest cf.yml
//! errandd --data-dir /var/lib/errandd run-errand cf smoke-tests
//! ```

mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use errand_director::DirectorConfig;
use tracing::info;

#[derive(Parser)]
#[command(name = "errandd", about = "Errand director daemon")]
struct Cli {
    /// Data directory for persistent state.
    #[arg(long, global = true, default_value = "/var/lib/errandd")]
    data_dir: PathBuf,

    /// Director configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a deployment manifest and store it.
    Deploy {
        /// Path to the manifest (YAML).
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Run an errand job. Ctrl-C requests cancellation; cleanup still runs.
    RunErrand {
        deployment: String,
        errand: String,
    },

    /// List tasks.
    Tasks,

    /// List resource pools.
    Pools,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(standalone::DEFAULT_LOG_FILTER)
            }),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DirectorConfig::from_file(path)?,
        None => DirectorConfig::default(),
    };
    let state = standalone::open_state(&cli.data_dir)?;

    match cli.command {
        Command::Deploy { manifest } => {
            let content = std::fs::read_to_string(&manifest)?;
            let record = standalone::deploy(&state, &content, &config)?;
            info!(deployment = %record.name, "deployment stored");
            println!("Deployment `{}' stored", record.name);
        }
        Command::RunErrand { deployment, errand } => {
            let result = standalone::run_errand(&state, config, &deployment, &errand).await?;
            println!("{result}");
        }
        Command::Tasks => {
            for task in state.list_tasks()? {
                println!("{}", serde_json::to_string(&task)?);
            }
        }
        Command::Pools => {
            for pool in state.list_pools()? {
                println!("{}", serde_json::to_string(&pool)?);
            }
        }
    }
    Ok(())
}
