//! The task store contract.

use std::time::Duration;

use async_trait::async_trait;

use tonal_models::{QueuedTask, TaskId};

use crate::error::StoreResult;

/// Result of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Task retry count after the increment
    pub retry_count: u32,
    /// The retry ceiling has been reached; the task will not be requeued
    pub permanent: bool,
}

impl FailureOutcome {
    pub fn new(retry_count: u32, max_retries: u32) -> Self {
        Self {
            retry_count,
            permanent: retry_count >= max_retries,
        }
    }
}

/// Counts from a failed-retry sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweep {
    /// Tasks moved from `failed` back to `pending`
    pub requeued: u64,
    /// Tasks left `failed` because they reached the retry ceiling
    pub permanently_failed: u64,
}

/// Durable record of task progress.
///
/// Every status change goes through one of these calls, each applied
/// atomically. Completion and failure writes only match tasks that are
/// currently `processing`, so a task's own transitions happen at most once.
#[async_trait]
pub trait TaskStore: Send {
    /// Up to `limit` pending tasks, most recently modified media first,
    /// ties broken by id.
    async fn fetch_pending(&mut self, limit: usize) -> StoreResult<Vec<QueuedTask>>;

    /// Claim tasks for dispatch: `pending -> processing`, stamping
    /// `started_at`. Returns only the ids that were actually claimed.
    async fn mark_processing(&mut self, ids: &[TaskId]) -> StoreResult<Vec<TaskId>>;

    /// Persist an analysis result and mark the task completed.
    ///
    /// Returns `false` if the task was no longer `processing`.
    async fn save_result(
        &mut self,
        id: &TaskId,
        result: &serde_json::Value,
        version: &str,
    ) -> StoreResult<bool>;

    /// Mark the task failed, bump its retry count and upsert its failure
    /// ledger entry, in one transaction.
    ///
    /// Returns `None` if the task was no longer `processing`.
    async fn record_failure(
        &mut self,
        id: &TaskId,
        error: &str,
        max_retries: u32,
    ) -> StoreResult<Option<FailureOutcome>>;

    /// Requeue `processing` tasks older than `threshold` whose retry count is
    /// below `max_retries`, incrementing the count by one. Returns how many.
    async fn reclaim_stale(&mut self, threshold: Duration, max_retries: u32) -> StoreResult<u64>;

    /// Requeue `failed` tasks below `max_retries` and clear their error.
    async fn retry_failed(&mut self, max_retries: u32) -> StoreResult<RetrySweep>;

    /// Operator-configured pool size, if one is stored.
    async fn worker_setting(&mut self) -> StoreResult<Option<i64>>;

    /// Drop the current connection(s) and connect again.
    async fn reconnect(&mut self) -> StoreResult<()>;

    /// Release the connection(s).
    async fn close(&mut self);
}
