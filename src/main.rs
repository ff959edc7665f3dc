use std::process::ExitCode;
use tracing::{error, info};

mod browser;
mod cli;
mod fetch;
mod pipeline;
mod storage;
mod utils;

use cli::config::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = cli::parse_args();

    let settings = match Settings::load(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    // Initialize logging
    let level = settings.tracing_level().unwrap_or("info");
    if let Err(e) = utils::init_logging(level, settings.log_format, args.log_file.clone()) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(1);
    }

    info!("Starting quora-broker v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args, settings).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("Command failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}
