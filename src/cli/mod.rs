pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::config::Settings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file; defaults to the user config directory
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume fetch tasks and run the pipeline until interrupted
    Run {
        /// Maximum number of tasks processed at once
        #[arg(short, long)]
        max_concurrent: Option<usize>,

        /// Seconds to wait for in-flight tasks on shutdown
        #[arg(short, long)]
        drain_timeout: Option<f64>,
    },

    /// Publish fetch tasks to the request topic
    Enqueue {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// Task priority (0-100)
        #[arg(short, long)]
        priority: Option<i64>,

        /// Explicit record id; only valid with a single URL
        #[arg(long)]
        id: Option<String>,
    },

    /// Run the selector extraction over a saved HTML file
    Extract {
        /// HTML file to read
        #[arg(required = true)]
        file: PathBuf,
    },

    /// Show the effective configuration with secrets redacted
    Config,
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command, returning the process exit code
pub async fn process_command(cli: Cli, settings: Settings) -> Result<u8> {
    match cli.command {
        Commands::Run { max_concurrent, drain_timeout } => {
            commands::run(settings, max_concurrent, drain_timeout).await
        }
        Commands::Enqueue { urls, priority, id } => {
            info!("Enqueueing {} task(s) to {}", urls.len(), settings.request_topic);
            commands::enqueue(&settings, urls, priority, id).await?;
            Ok(0)
        }
        Commands::Extract { file } => {
            commands::extract(&settings, &file).await?;
            Ok(0)
        }
        Commands::Config => {
            commands::show_config(&settings)?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "quora-broker",
            "run",
            "--max-concurrent",
            "4",
            "--config",
            "broker.yaml",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("broker.yaml")));
        assert!(matches!(
            cli.command,
            Commands::Run { max_concurrent: Some(4), drain_timeout: None }
        ));
    }

    #[test]
    fn test_enqueue_requires_url() {
        assert!(Cli::try_parse_from(["quora-broker", "enqueue"]).is_err());

        let cli = Cli::try_parse_from([
            "quora-broker",
            "enqueue",
            "https://www.quora.com/a",
            "https://www.quora.com/b",
            "-p",
            "5",
        ])
        .unwrap();
        match cli.command {
            Commands::Enqueue { urls, priority, id } => {
                assert_eq!(urls.len(), 2);
                assert_eq!(priority, Some(5));
                assert_eq!(id, None);
            }
            _ => panic!("expected enqueue"),
        }
    }
}
