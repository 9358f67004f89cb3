pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug-level logging for this crate
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Also write logs to the default per-command log file
    #[arg(long, global = true, conflicts_with = "log_file")]
    pub log_to_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume tasks from the work queue and publish paths to the results queue
    Worker {
        /// Consumer name (default `worker-<hostname>`); unique per live worker,
        /// reused after a crash to get unacknowledged tasks back
        #[arg(short, long)]
        name: Option<String>,

        /// Maximum crawl depth
        #[arg(short, long)]
        depth: Option<u32>,
    },

    /// Route results back to requesters and answer RPC requests
    Gateway,

    /// Queue a task and print its id without waiting
    Submit {
        /// URL to start from
        #[arg(required = true)]
        start: String,

        /// URL to look for
        #[arg(required = true)]
        target: String,
    },

    /// Ask a running gateway for a path and wait for the answer
    Request {
        /// URL to start from
        #[arg(required = true)]
        start: String,

        /// URL to look for
        #[arg(required = true)]
        target: String,

        /// Seconds to wait for the answer
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Run one search in this process, without a broker
    Search {
        /// URL to start from
        #[arg(required = true)]
        start: String,

        /// URL to look for
        #[arg(required = true)]
        target: String,

        /// Maximum crawl depth
        #[arg(short, long)]
        depth: Option<u32>,
    },

    /// Run gateway and worker together over an in-process queue
    Standalone {
        /// URL to start from
        #[arg(required = true)]
        start: String,

        /// URL to look for
        #[arg(required = true)]
        target: String,

        /// Maximum crawl depth
        #[arg(short, long)]
        depth: Option<u32>,
    },

    /// Show the configuration, or write the default one
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
    },
}

impl Cli {
    /// Name used for the default log file
    pub fn role(&self) -> &'static str {
        match self.command {
            Commands::Worker { .. } => "worker",
            Commands::Gateway => "gateway",
            Commands::Submit { .. } | Commands::Request { .. } => "client",
            Commands::Search { .. } => "search",
            Commands::Standalone { .. } => "standalone",
            Commands::Config { .. } => "config",
        }
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Worker { name, depth } => {
            info!("Starting worker");
            commands::worker(config_path, name, depth).await
        }
        Commands::Gateway => {
            info!("Starting gateway");
            commands::gateway(config_path).await
        }
        Commands::Submit { start, target } => commands::submit(config_path, start, target).await,
        Commands::Request { start, target, timeout } => {
            commands::request(config_path, start, target, timeout).await
        }
        Commands::Search { start, target, depth } => {
            info!("Searching for {} from {}", target, start);
            commands::search(config_path, start, target, depth).await
        }
        Commands::Standalone { start, target, depth } => {
            info!("Running standalone search for {} from {}", target, start);
            commands::standalone(config_path, start, target, depth).await
        }
        Commands::Config { init } => {
            if init {
                commands::init_config(config_path).await
            } else {
                commands::show_config(config_path).await
            }
        }
    }
}
