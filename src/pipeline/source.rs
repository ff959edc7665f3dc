use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use redis::RedisError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::pipeline::task::{FetchTask, ParsedPage};
use crate::storage::queue::{MessageQueue, RedisQueue};

/// How long one blocking pop waits before polling again
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// URLs served when no broker is available
pub const SAMPLE_URLS: [&str; 2] = ["https://example.org", "https://www.python.org"];

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to connect to broker at {url}: {source}")]
    Connection {
        url: String,
        #[source]
        source: RedisError,
    },

    #[error("queue operation failed: {0}")]
    Queue(#[from] RedisError),

    #[error("task source is not started")]
    NotStarted,
}

/// Handle used to acknowledge or reject the message a task came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt(String);

impl Receipt {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn payload(&self) -> &str {
        &self.0
    }
}

/// A task together with its queue receipt (none for synthetic tasks)
#[derive(Debug)]
pub struct QueuedTask {
    pub task: FetchTask,
    pub receipt: Option<Receipt>,
}

impl QueuedTask {
    pub fn synthetic(task: FetchTask) -> Self {
        Self { task, receipt: None }
    }
}

/// Where fetch tasks come from
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// Establish the queue connection
    async fn start(&self) -> Result<(), SourceError>;

    /// Next valid task. `Ok(None)` means the source is exhausted.
    /// Invalid messages are logged and skipped, never returned.
    async fn next_task(&self) -> Result<Option<QueuedTask>, SourceError>;

    /// The task's record was persisted; the message is done
    async fn ack(&self, receipt: &Receipt) -> Result<(), SourceError>;

    /// The task could not be completed; park its message
    async fn dead_letter(&self, receipt: &Receipt, reason: &str) -> Result<(), SourceError>;

    /// Forward an extracted question/answer downstream
    async fn publish_parsed(&self, _page: &ParsedPage) -> Result<(), SourceError> {
        Ok(())
    }

    /// Release the queue connection. Idempotent.
    async fn stop(&self);

    /// True for the synthetic fallback
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Lazy stream of tasks over [`TaskSource::next_task`].
///
/// Ends when the source is exhausted or reports an error.
pub fn tasks(source: Arc<dyn TaskSource>) -> BoxStream<'static, QueuedTask> {
    Box::pin(stream::unfold(source, |source| async move {
        match source.next_task().await {
            Ok(Some(task)) => Some((task, source)),
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "Task source failed; ending stream");
                None
            }
        }
    }))
}

/// Consumes fetch requests from a Redis topic
pub struct QueueTaskSource {
    request_topic: String,
    parsed_topic: String,
    queue: RwLock<Option<Arc<dyn MessageQueue>>>,
}

impl QueueTaskSource {
    /// Connect to the broker. Consumption begins with `start`.
    pub async fn connect(
        broker_url: &str,
        request_topic: &str,
        parsed_topic: &str,
    ) -> Result<Self, SourceError> {
        let queue = RedisQueue::connect(broker_url, request_topic)
            .await
            .map_err(|source| SourceError::Connection {
                url: broker_url.to_string(),
                source,
            })?;

        Ok(Self::with_queue(Arc::new(queue), request_topic, parsed_topic))
    }

    pub fn with_queue(
        queue: Arc<dyn MessageQueue>,
        request_topic: &str,
        parsed_topic: &str,
    ) -> Self {
        Self {
            request_topic: request_topic.to_string(),
            parsed_topic: parsed_topic.to_string(),
            queue: RwLock::new(Some(queue)),
        }
    }

    async fn queue(&self) -> Result<Arc<dyn MessageQueue>, SourceError> {
        self.queue.read().await.clone().ok_or(SourceError::NotStarted)
    }
}

#[async_trait]
impl TaskSource for QueueTaskSource {
    /// Requeue whatever a previous consumer left unacknowledged
    async fn start(&self) -> Result<(), SourceError> {
        self.queue().await?.requeue_unacked().await?;
        info!(topic = %self.request_topic, "queue_consumer_started");
        Ok(())
    }

    async fn next_task(&self) -> Result<Option<QueuedTask>, SourceError> {
        let queue = self.queue().await?;

        loop {
            let Some(message) = queue.pop(POLL_TIMEOUT).await? else {
                continue;
            };

            match FetchTask::from_json(message.as_bytes()) {
                Ok(task) => {
                    return Ok(Some(QueuedTask {
                        task,
                        receipt: Some(Receipt::new(message)),
                    }))
                }
                Err(e) => {
                    error!(error = %e, payload = %message, "invalid_message");
                    if let Err(e) = queue.dead_letter(&message, &e.to_string()).await {
                        warn!(error = %e, "Failed to dead-letter invalid message");
                    }
                }
            }
        }
    }

    async fn ack(&self, receipt: &Receipt) -> Result<(), SourceError> {
        self.queue().await?.ack(receipt.payload()).await?;
        Ok(())
    }

    async fn dead_letter(&self, receipt: &Receipt, reason: &str) -> Result<(), SourceError> {
        self.queue().await?.dead_letter(receipt.payload(), reason).await?;
        Ok(())
    }

    async fn publish_parsed(&self, page: &ParsedPage) -> Result<(), SourceError> {
        let message = match serde_json::to_string(page) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, url = %page.url, "Failed to encode parsed page");
                return Ok(());
            }
        };

        self.queue().await?.publish(&self.parsed_topic, &message).await?;
        Ok(())
    }

    async fn stop(&self) {
        if self.queue.write().await.take().is_some() {
            info!(topic = %self.request_topic, "queue_consumer_stopped");
        }
    }
}

/// Finite in-memory task list standing in for a broker.
///
/// Only meant to keep the service exercisable without infrastructure.
pub struct SyntheticTaskSource {
    pending: Mutex<VecDeque<FetchTask>>,
}

impl SyntheticTaskSource {
    pub fn new(tasks: Vec<FetchTask>) -> Self {
        Self {
            pending: Mutex::new(tasks.into()),
        }
    }

    /// The fixed sample set used in degraded mode
    pub fn samples() -> Self {
        let tasks = SAMPLE_URLS
            .iter()
            .filter_map(|url| FetchTask::new(*url, None, None).ok())
            .collect();
        Self::new(tasks)
    }
}

#[async_trait]
impl TaskSource for SyntheticTaskSource {
    async fn start(&self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn next_task(&self) -> Result<Option<QueuedTask>, SourceError> {
        Ok(self.pending.lock().await.pop_front().map(QueuedTask::synthetic))
    }

    async fn ack(&self, _receipt: &Receipt) -> Result<(), SourceError> {
        Ok(())
    }

    async fn dead_letter(&self, receipt: &Receipt, reason: &str) -> Result<(), SourceError> {
        warn!(
            payload = %receipt.payload(),
            reason = %reason,
            "Synthetic source dropping failed task"
        );
        Ok(())
    }

    async fn stop(&self) {
        self.pending.lock().await.clear();
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

/// Resolve the task source once at startup.
///
/// No broker configured, or an unreachable broker when it is not required,
/// selects the synthetic source.
pub async fn connect_source(
    broker_url: Option<&str>,
    request_topic: &str,
    parsed_topic: &str,
    require_broker: bool,
) -> Result<Arc<dyn TaskSource>, SourceError> {
    let Some(broker_url) = broker_url else {
        error!(reason = "no broker configured", samples = SAMPLE_URLS.len(), "degraded_mode");
        return Ok(Arc::new(SyntheticTaskSource::samples()));
    };

    let started = match QueueTaskSource::connect(broker_url, request_topic, parsed_topic).await {
        Ok(source) => match source.start().await {
            Ok(()) => Ok(source),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    match started {
        Ok(source) => Ok(Arc::new(source)),
        Err(e) if require_broker => Err(e),
        Err(e) => {
            error!(
                reason = "broker unreachable",
                error = %e,
                samples = SAMPLE_URLS.len(),
                "degraded_mode"
            );
            Ok(Arc::new(SyntheticTaskSource::samples()))
        }
    }
}
