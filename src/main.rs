use anyhow::Result;
use tracing::{error, info};

mod cli;
mod crawler;
mod pipeline;
mod storage;
mod utils;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // Initialize logging
    let log_file = match (&args.log_file, args.log_to_file) {
        (Some(path), _) => Some(path.clone()),
        (None, true) => Some(utils::default_log_file(args.role())),
        (None, false) => None,
    };
    utils::init_logging(args.verbose, log_file.as_deref())?;

    info!("Starting Path Crawler v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
