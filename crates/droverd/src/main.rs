//! droverd — the Drover daemon.
//!
//! Single binary assembling the orchestrator:
//! - State store (redb)
//! - Cluster resources DB + membership
//! - Instance scheduler
//! - Application state machine + staleness reconciler
//! - Executor engine (in-process runtime) + zombie reaper
//!
//! # Usage
//!
//! ```text
//! droverd standalone --data-dir /var/lib/drover --app drover.toml
//! ```

mod config;
mod standalone;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "droverd", about = "Drover orchestration daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run in standalone mode (controller + executor in one process).
    Standalone {
        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/drover")]
        data_dir: PathBuf,

        /// Optional drover.toml application spec to create on startup.
        #[arg(long)]
        app: Option<PathBuf>,

        /// Heartbeat interval in seconds.
        #[arg(long, default_value = "5")]
        heartbeat_interval: u64,

        /// Staleness sweep interval in seconds.
        #[arg(long, default_value = "15")]
        reconcile_interval: u64,

        /// Zombie reaper interval in seconds.
        #[arg(long, default_value = "30")]
        reaper_interval: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,droverd=debug,drover=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            app,
            heartbeat_interval,
            reconcile_interval,
            reaper_interval,
        } => {
            standalone::run(standalone::StandaloneOptions {
                data_dir,
                app,
                heartbeat_interval,
                reconcile_interval,
                reaper_interval,
            })
            .await
        }
    }
}
