//! Workload driver CLI
//!
//! A command-line tool for registering, controlling and inspecting
//! workloads on a running workload driver service.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{health, workloads, workloads::Action};
use std::path::PathBuf;

/// Workload driver CLI
#[derive(Parser)]
#[command(name = "wdctl")]
#[command(author, version, about = "CLI for the workload driver", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via WDCTL_API_URL env var)
    #[arg(long, env = "WDCTL_API_URL", default_value = "http://localhost:8080")]
    pub api_url: String,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List registered workloads
    List,

    /// Show one workload in detail
    Get {
        /// Workload ID
        id: String,
    },

    /// Register a template workload from a JSON file
    Register {
        /// Path to the template file
        file: PathBuf,

        /// Override the workload name in the template
        #[arg(long)]
        name: Option<String>,
    },

    /// Start a registered workload
    Start {
        /// Workload ID
        id: String,
    },

    /// Pause a running workload
    Pause {
        /// Workload ID
        id: String,
    },

    /// Resume a paused workload
    Unpause {
        /// Workload ID
        id: String,
    },

    /// Stop a workload before it finishes
    Stop {
        /// Workload ID
        id: String,
    },

    /// Show service health
    Health,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = client::ApiClient::new(&cli.api_url)?;
    let format = cli.format;

    match cli.command {
        Commands::List => workloads::list_workloads(&client, format).await,
        Commands::Get { id } => workloads::show_workload(&client, &id, format).await,
        Commands::Register { file, name } => {
            workloads::register_workload(&client, &file, name, format).await
        }
        Commands::Start { id } => {
            workloads::control_workload(&client, &id, Action::Start, format).await
        }
        Commands::Pause { id } => {
            workloads::control_workload(&client, &id, Action::Pause, format).await
        }
        Commands::Unpause { id } => {
            workloads::control_workload(&client, &id, Action::Unpause, format).await
        }
        Commands::Stop { id } => workloads::control_workload(&client, &id, Action::Stop, format).await,
        Commands::Health => health::show_health(&client, format).await,
    }
}
