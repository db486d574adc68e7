//! Corrective sweeps that keep tasks moving.

use std::time::Duration;

use tracing::{info, warn};

use tonal_store::TaskStore;

use crate::error::WorkerResult;
use crate::metrics;

/// Counts from one run of both sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub stale_requeued: u64,
    pub failed_requeued: u64,
    pub permanently_failed: u64,
}

/// Requeues orphaned and retriable tasks.
#[derive(Debug, Clone)]
pub struct ReclamationEngine {
    stale_after: Duration,
    max_retries: u32,
}

impl ReclamationEngine {
    pub fn new(stale_after: Duration, max_retries: u32) -> Self {
        Self {
            stale_after,
            max_retries,
        }
    }

    /// Return `processing` tasks older than the threshold to `pending`.
    pub async fn sweep_stale<S: TaskStore>(&self, store: &mut S) -> WorkerResult<u64> {
        let reclaimed = store
            .reclaim_stale(self.stale_after, self.max_retries)
            .await?;
        if reclaimed > 0 {
            info!(
                "Reset {} stale processing tasks (no progress for {} min)",
                reclaimed,
                self.stale_after.as_secs() / 60
            );
        }
        metrics::record_tasks_reclaimed("stale", reclaimed);
        Ok(reclaimed)
    }

    /// Return retriable `failed` tasks to `pending`.
    pub async fn sweep_failed<S: TaskStore>(&self, store: &mut S) -> WorkerResult<(u64, u64)> {
        let sweep = store.retry_failed(self.max_retries).await?;
        if sweep.requeued > 0 {
            info!(
                "Re-queued {} failed tasks for retry (max {} retries)",
                sweep.requeued, self.max_retries
            );
        }
        if sweep.permanently_failed > 0 {
            warn!(
                "{} tasks have permanently failed (exceeded {} retries)",
                sweep.permanently_failed, self.max_retries
            );
        }
        metrics::record_tasks_reclaimed("failed", sweep.requeued);
        Ok((sweep.requeued, sweep.permanently_failed))
    }

    /// Run both sweeps, stale first.
    pub async fn run_all<S: TaskStore>(&self, store: &mut S) -> WorkerResult<ReclaimReport> {
        let stale_requeued = self.sweep_stale(store).await?;
        let (failed_requeued, permanently_failed) = self.sweep_failed(store).await?;
        Ok(ReclaimReport {
            stale_requeued,
            failed_requeued,
            permanently_failed,
        })
    }
}
