use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client, RedisError};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::pipeline::task::FetchTask;

/// Consumer-side operations on one topic with at-least-once delivery
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Move messages a previous consumer left unacknowledged back onto the topic
    async fn requeue_unacked(&self) -> Result<usize, RedisError>;

    /// Wait up to `timeout` for the next message, claiming it for processing
    async fn pop(&self, timeout: Duration) -> Result<Option<String>, RedisError>;

    /// Acknowledge a processed message
    async fn ack(&self, message: &str) -> Result<(), RedisError>;

    /// Park a message on the dead-letter list and release it from processing
    async fn dead_letter(&self, message: &str, reason: &str) -> Result<(), RedisError>;

    /// Append a message to any topic on the same broker
    async fn publish(&self, topic: &str, message: &str) -> Result<(), RedisError>;
}

pub fn processing_key(topic: &str) -> String {
    format!("{}:processing", topic)
}

pub fn dead_letter_key(topic: &str) -> String {
    format!("{}:dead", topic)
}

/// JSON stored on the dead-letter list for a rejected message
pub fn dead_letter_envelope(message: &str, reason: &str) -> String {
    serde_json::json!({
        "payload": message,
        "reason": reason,
        "failed_at": chrono::Utc::now().to_rfc3339(),
    })
    .to_string()
}

/// Redis list-backed topic.
///
/// A topic `t` is the list `t`. Consuming moves a message atomically to
/// `t:processing`; acknowledging removes it from there. Messages that cannot
/// be processed are moved to `t:dead`.
pub struct RedisQueue {
    /// Dedicated connection for blocking pops
    consumer: Mutex<MultiplexedConnection>,

    /// Connection for everything else, so acks never wait behind a pop
    commands: MultiplexedConnection,

    topic: String,
}

impl RedisQueue {
    /// Connect to the broker and bind to a topic
    pub async fn connect(broker_url: &str, topic: &str) -> Result<Self, RedisError> {
        let client = Client::open(broker_url)?;

        let consumer = client.get_multiplexed_async_connection().await?;
        let mut commands = client.get_multiplexed_async_connection().await?;

        redis::cmd("PING")
            .query_async::<_, ()>(&mut commands)
            .await?;

        debug!("Connected to Redis for topic: {}", topic);

        Ok(Self {
            consumer: Mutex::new(consumer),
            commands,
            topic: topic.to_string(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append a message to this queue's topic
    pub async fn push(&self, message: &str) -> Result<(), RedisError> {
        self.publish(&self.topic, message).await
    }

    /// Encode a fetch task and append it to this queue's topic.
    ///
    /// A task without an id gets one here, so every delivery of the message
    /// produces the same record id. Returns that id.
    pub async fn push_task(&self, task: &FetchTask) -> Result<String, RedisError> {
        let task = task.clone().with_generated_id();
        let payload = task.to_json().map_err(|e| {
            RedisError::from((
                redis::ErrorKind::TypeError,
                "failed to encode task",
                e.to_string(),
            ))
        })?;

        self.push(&payload).await?;
        Ok(task.record_id())
    }

    /// Number of messages waiting on the topic
    pub async fn pending_count(&self) -> Result<usize, RedisError> {
        self.list_len(&self.topic).await
    }

    /// Number of claimed but unacknowledged messages
    pub async fn processing_count(&self) -> Result<usize, RedisError> {
        self.list_len(&processing_key(&self.topic)).await
    }

    /// Number of dead-lettered messages
    pub async fn dead_letter_count(&self) -> Result<usize, RedisError> {
        self.list_len(&dead_letter_key(&self.topic)).await
    }

    async fn list_len(&self, key: &str) -> Result<usize, RedisError> {
        let mut conn = self.commands.clone();

        redis::cmd("LLEN")
            .arg(key)
            .query_async(&mut conn)
            .await
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn requeue_unacked(&self) -> Result<usize, RedisError> {
        let processing_key = processing_key(&self.topic);
        let mut conn = self.commands.clone();
        let mut moved = 0;

        loop {
            let message: Option<String> = redis::cmd("LMOVE")
                .arg(&processing_key)
                .arg(&self.topic)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;

            if message.is_none() {
                break;
            }
            moved += 1;
        }

        if moved > 0 {
            info!(topic = %self.topic, count = moved, "Requeued unacknowledged messages");
        }

        Ok(moved)
    }

    async fn pop(&self, timeout: Duration) -> Result<Option<String>, RedisError> {
        let mut conn = self.consumer.lock().await;

        let message: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.topic)
            .arg(processing_key(&self.topic))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.as_secs_f64())
            .query_async(&mut *conn)
            .await?;

        Ok(message)
    }

    async fn ack(&self, message: &str) -> Result<(), RedisError> {
        let mut conn = self.commands.clone();

        redis::cmd("LREM")
            .arg(processing_key(&self.topic))
            .arg(1)
            .arg(message)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn dead_letter(&self, message: &str, reason: &str) -> Result<(), RedisError> {
        let mut conn = self.commands.clone();

        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(dead_letter_key(&self.topic))
            .arg(dead_letter_envelope(message, reason))
            .ignore()
            .cmd("LREM")
            .arg(processing_key(&self.topic))
            .arg(1)
            .arg(message)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;

        debug!(topic = %self.topic, "Moved message to dead-letter list");

        Ok(())
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<(), RedisError> {
        let mut conn = self.commands.clone();

        redis::cmd("LPUSH")
            .arg(topic)
            .arg(message)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }
}
