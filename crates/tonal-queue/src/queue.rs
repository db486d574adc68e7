//! Push queue using a Redis list.

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use tonal_models::QueuedTask;

use crate::error::QueueResult;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// List key producers push analysis requests onto
    pub queue_name: String,
    /// Pub/sub topic for runtime control commands
    pub control_channel: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            queue_name: "audio:analysis:queue".to_string(),
            control_channel: "audio:analysis:control".to_string(),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            queue_name: std::env::var("ANALYSIS_QUEUE").unwrap_or(defaults.queue_name),
            control_channel: std::env::var("CONTROL_CHANNEL").unwrap_or(defaults.control_channel),
        }
    }
}

/// Source of explicitly requested tasks.
///
/// Implementations must never block for long: an empty queue returns an
/// empty batch immediately.
#[async_trait]
pub trait TaskQueue: Send {
    /// Pop up to `max` tasks in FIFO order.
    async fn pop_batch(&mut self, max: usize) -> QueueResult<Vec<QueuedTask>>;
}

/// Decode one queue entry. Malformed entries are logged and dropped.
pub fn decode_envelope(payload: &str) -> Option<QueuedTask> {
    match serde_json::from_str::<QueuedTask>(payload) {
        Ok(task) => Some(task),
        Err(e) => {
            warn!("Dropping malformed queue entry: {} ({})", payload, e);
            None
        }
    }
}

/// Redis list client.
pub struct RedisTaskQueue {
    client: redis::Client,
    config: QueueConfig,
}

impl RedisTaskQueue {
    /// Create a new queue client. Does not connect until first use.
    pub fn new(config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self { client, config })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(QueueConfig::from_env())
    }

    /// Append a task to the tail of the queue.
    pub async fn enqueue(&self, task: &QueuedTask) -> QueueResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let payload = serde_json::to_string(task)?;

        conn.rpush::<_, _, ()>(&self.config.queue_name, payload).await?;

        info!("Enqueued task {} on {}", task.id, self.config.queue_name);
        Ok(())
    }

    /// Get queue length.
    pub async fn len(&self) -> QueueResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let len: u64 = conn.llen(&self.config.queue_name).await?;
        Ok(len)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn pop_batch(&mut self, max: usize) -> QueueResult<Vec<QueuedTask>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let mut tasks = Vec::new();

        for _ in 0..max {
            let entry: Option<String> = conn.lpop(&self.config.queue_name, None).await?;
            let Some(payload) = entry else {
                break;
            };
            if let Some(task) = decode_envelope(&payload) {
                tasks.push(task);
            }
        }

        if !tasks.is_empty() {
            debug!("Popped {} tasks from {}", tasks.len(), self.config.queue_name);
        }

        Ok(tasks)
    }
}
