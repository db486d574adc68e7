//! Batch intake: push queue first, store query as fallback.

use tracing::{debug, warn};

use tonal_models::QueuedTask;
use tonal_queue::TaskQueue;
use tonal_store::TaskStore;

use crate::error::WorkerResult;

/// Supplies batches of pending tasks.
pub struct JobSource<Q> {
    queue: Q,
}

impl<Q: TaskQueue> JobSource<Q> {
    pub fn new(queue: Q) -> Self {
        Self { queue }
    }

    /// Up to `max` tasks, possibly none.
    ///
    /// A queue failure is logged and the store is queried instead; only
    /// store errors propagate. Duplicate ids within a batch are dropped.
    pub async fn next_batch<S: TaskStore>(
        &mut self,
        store: &mut S,
        max: usize,
    ) -> WorkerResult<Vec<QueuedTask>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let queued = match self.queue.pop_batch(max).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Push queue unavailable, falling back to store: {}", e);
                Vec::new()
            }
        };

        let batch = if queued.is_empty() {
            store.fetch_pending(max).await?
        } else {
            debug!("Took {} tasks from the push queue", queued.len());
            queued
        };

        Ok(dedupe(batch))
    }
}

fn dedupe(batch: Vec<QueuedTask>) -> Vec<QueuedTask> {
    let mut seen = std::collections::HashSet::new();
    batch
        .into_iter()
        .filter(|task| seen.insert(task.id.clone()))
        .collect()
}
