use anyhow::{bail, Context, Result};
use redis::RedisError;
use std::path::Path;
use tokio::signal;
use tracing::{info, warn};

use crate::browser::selectors::SelectorSet;
use crate::cli::config::Settings;
use crate::pipeline::coordinator::{Pipeline, PipelineError, PipelineOptions};
use crate::pipeline::task::FetchTask;
use crate::storage::queue::RedisQueue;

/// Exit code when startup is interrupted
pub const EXIT_INTERRUPTED: u8 = 130;

/// Run the pipeline until interrupted or the task source is exhausted
pub async fn run(
    mut settings: Settings,
    max_concurrent: Option<usize>,
    drain_timeout: Option<f64>,
) -> Result<u8> {
    // Override configuration with command line parameters if provided
    if let Some(n) = max_concurrent {
        settings.max_concurrent_fetches = n;
    }
    if let Some(secs) = drain_timeout {
        settings.drain_timeout_seconds = Some(secs);
    }
    settings.validate().context("Invalid configuration")?;

    let redacted = serde_json::to_string(&settings.redacted())
        .context("Failed to encode settings")?;
    info!(settings = %redacted, "service_starting");

    let mut pipeline = Pipeline::new(PipelineOptions::from_settings(&settings)?);

    // Listen from the start so an interrupt during startup releases built stages
    let handle = pipeline.shutdown_handle();
    let listener = tokio::spawn(async move {
        wait_for_signal().await;
        info!(shutting_down = true, "signal_received");
        handle.shutdown();
    });

    if let Err(e) = pipeline.start(&settings).await {
        listener.abort();
        if PipelineError::is_interrupted(&e) {
            warn!("Interrupted during startup");
            return Ok(EXIT_INTERRUPTED);
        }
        return Err(e.context("Failed to start pipeline"));
    }

    let outcome = pipeline.run().await;
    listener.abort();

    let snapshot = outcome?;
    info!(
        completed = snapshot.completed(),
        bytes = snapshot.bytes_downloaded,
        extracted = snapshot.extractions_with_content,
        "Pipeline finished"
    );

    Ok(0)
}

/// Publish one fetch task per URL to the request topic
pub async fn enqueue(
    settings: &Settings,
    urls: Vec<String>,
    priority: Option<i64>,
    id: Option<String>,
) -> Result<()> {
    let Some(broker_url) = settings.broker_url.as_deref() else {
        bail!("No broker configured; set BROKER_URL or broker_url in the configuration file");
    };

    if id.is_some() && urls.len() > 1 {
        bail!("--id can only be used with a single URL");
    }

    // Validate everything before publishing anything
    let tasks = urls
        .into_iter()
        .map(|url| FetchTask::new(url, id.clone(), priority))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid fetch task")?;

    let queue = RedisQueue::connect(broker_url, &settings.request_topic)
        .await
        .context(format!("Failed to connect to broker at {}", broker_url))?;

    for task in &tasks {
        let id = queue
            .push_task(task)
            .await
            .context(format!("Failed to enqueue {}", task.url()))?;
        info!(url = %task.url(), id = %id, "Task enqueued");
        println!("{}  {}", id, task.url());
    }

    println!("Enqueued {} task(s) to {}", tasks.len(), queue.topic());
    for (label, count) in [
        ("Pending", queue.pending_count().await),
        ("Processing", queue.processing_count().await),
        ("Dead-lettered", queue.dead_letter_count().await),
    ] {
        println!("{}", count_line(label, count));
    }

    Ok(())
}

/// One line of queue statistics. A failed read is logged and shown as unavailable.
fn count_line(label: &str, count: Result<usize, RedisError>) -> String {
    match count {
        Ok(count) => format!("{}: {}", label, count),
        Err(e) => {
            warn!(error = %e, "Failed to read {} count", label.to_lowercase());
            format!("{}: unavailable ({})", label, e)
        }
    }
}

/// Print the question/answer extracted from a saved HTML file
pub async fn extract(settings: &Settings, file: &Path) -> Result<()> {
    let html = tokio::fs::read_to_string(file)
        .await
        .context(format!("Failed to read HTML file: {}", file.display()))?;

    let selectors = SelectorSet::new(&settings.question_selector, &settings.answer_selector)?;
    let extraction = selectors.extract(&html);

    println!("{}", serde_json::to_string_pretty(&extraction)?);
    Ok(())
}

/// Print the effective configuration with secrets redacted
pub fn show_config(settings: &Settings) -> Result<()> {
    let yaml = serde_yaml::to_string(&settings.redacted())
        .context("Failed to serialize configuration")?;

    match Settings::default_config_path() {
        Some(path) => println!("# Default configuration file: {}", path.display()),
        None => println!("# No default configuration directory available"),
    }
    println!("{}", yaml);

    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM
async fn wait_for_signal() {
    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        }
        _ = wait_for_sigterm() => {}
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_enqueue_requires_broker() {
        let settings = Settings::default();
        let err = enqueue(&settings, vec!["https://www.quora.com/q".to_string()], None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No broker configured"));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_shared_id() {
        let settings = Settings {
            broker_url: Some("redis://127.0.0.1:1".to_string()),
            ..Settings::default()
        };
        let urls = vec!["https://a.example".to_string(), "https://b.example".to_string()];
        let err = enqueue(&settings, urls, None, Some("fixed".to_string()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("single URL"));
    }

    #[tokio::test]
    async fn test_enqueue_validates_before_connecting() {
        let settings = Settings {
            broker_url: Some("redis://127.0.0.1:1".to_string()),
            ..Settings::default()
        };
        let err = enqueue(&settings, vec!["ftp://files.example".to_string()], None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid fetch task"));
    }

    #[test]
    fn test_count_line_reports_read_failures() {
        assert_eq!(count_line("Pending", Ok(4)), "Pending: 4");

        let failure = RedisError::from((redis::ErrorKind::IoError, "connection reset"));
        let line = count_line("Dead-lettered", Err(failure));
        assert!(line.starts_with("Dead-lettered: unavailable"));
        assert!(line.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_extract_reads_file() {
        let path = std::env::temp_dir().join(format!("quora-broker-{}.html", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "<html><body><p>nothing here</p></body></html>").unwrap();

        assert!(extract(&Settings::default(), &path).await.is_ok());
        std::fs::remove_file(&path).unwrap();

        assert!(extract(&Settings::default(), &path).await.is_err());
    }

    #[tokio::test]
    async fn test_run_rejects_invalid_override() {
        let err = run(Settings::default(), Some(0), None).await.unwrap_err();
        assert!(err.to_string().contains("Invalid configuration"));
    }
}
