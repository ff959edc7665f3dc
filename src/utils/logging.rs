use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::config::LogFormat;

/// Build the filter: `RUST_LOG` when set, else the configured level for this
/// crate and `warn` for everything else.
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    filter_from(rust_log.as_deref(), level)
}

fn filter_from(rust_log: Option<&str>, level: &str) -> Result<EnvFilter> {
    match rust_log.map(str::trim).filter(|directives| !directives.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives)
            .context(format!("Invalid {}: {}", EnvFilter::DEFAULT_ENV, directives)),
        None => EnvFilter::try_new(format!("warn,quora_broker={}", level))
            .context(format!("Invalid log level: {}", level)),
    }
}

/// Initialize the logging system
pub fn init_logging(level: &str, format: LogFormat, log_file: Option<PathBuf>) -> Result<()> {
    let env_filter = build_filter(level)?;

    let text_layer = (format == LogFormat::Text).then(|| fmt::layer().with_target(true));
    let json_layer = (format == LogFormat::Json).then(|| {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_target(true)
    });

    // If a log file is specified, mirror output there without colours
    let file_layer = match log_file {
        Some(log_file) => {
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_file)?;
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_level_applies_without_rust_log() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            let filter = filter_from(None, level).unwrap().to_string();
            assert!(filter.contains(&format!("quora_broker={}", level)));
            assert!(filter.contains("warn"));
        }
    }

    #[test]
    fn test_rust_log_replaces_defaults() {
        let filter = filter_from(Some("trace"), "error").unwrap().to_string();
        assert_eq!(filter, "trace");

        let filter = filter_from(Some("quora_broker=debug"), "error").unwrap().to_string();
        assert_eq!(filter, "quora_broker=debug");

        let filter = filter_from(Some("  "), "info").unwrap().to_string();
        assert!(filter.contains("quora_broker=info"));
    }

    #[test]
    fn test_filter_rejects_garbage() {
        assert!(filter_from(None, "not a level!").is_err());
        assert!(filter_from(Some("quora_broker=loud"), "info").is_err());
    }
}
