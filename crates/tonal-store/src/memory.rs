//! In-memory task store.
//!
//! Applies the same transition rules as the PostgreSQL store. Clones share
//! state, so a caller can keep a handle for inspection while the
//! orchestrator owns another.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use tonal_models::{
    truncate_error, FailureMetadata, FailureRecord, QueuedTask, Task, TaskId, TaskStatus,
    AUDIO_ENTITY_TYPE,
};

use crate::error::{StoreError, StoreResult};
use crate::store::{FailureOutcome, RetrySweep, TaskStore};

#[derive(Debug, Default)]
struct State {
    tasks: BTreeMap<TaskId, Task>,
    failures: HashMap<(String, String), FailureRecord>,
    worker_setting: Option<i64>,
    fail_next: usize,
    reconnects: usize,
    closes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    state: Arc<Mutex<State>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Consume one injected failure, if any are armed.
    fn check_available(&self) -> StoreResult<MutexGuard<'_, State>> {
        let mut state = self.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(StoreError::connection_failed("injected failure"));
        }
        Ok(state)
    }

    /// Insert or replace a task row.
    pub fn insert(&self, task: Task) {
        self.lock().tasks.insert(task.id.clone(), task);
    }

    pub fn get(&self, id: &TaskId) -> Option<Task> {
        self.lock().tasks.get(id).cloned()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.lock().tasks.values().cloned().collect()
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| t.status == status)
            .count()
    }

    /// Ledger entry for an audio task.
    pub fn failure(&self, id: &TaskId) -> Option<FailureRecord> {
        self.lock()
            .failures
            .get(&(AUDIO_ENTITY_TYPE.to_string(), id.as_str().to_string()))
            .cloned()
    }

    /// Mark a ledger entry as acknowledged by an operator.
    pub fn resolve_failure(&self, id: &TaskId) {
        let key = (AUDIO_ENTITY_TYPE.to_string(), id.as_str().to_string());
        if let Some(record) = self.lock().failures.get_mut(&key) {
            record.resolved = true;
        }
    }

    pub fn set_worker_setting(&self, workers: Option<i64>) {
        self.lock().worker_setting = workers;
    }

    /// Make the next `n` store calls fail with a connection error.
    pub fn fail_next(&self, n: usize) {
        self.lock().fail_next = n;
    }

    pub fn reconnect_count(&self) -> usize {
        self.lock().reconnects
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn fetch_pending(&mut self, limit: usize) -> StoreResult<Vec<QueuedTask>> {
        let state = self.check_available()?;

        let mut pending: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .collect();
        // Newest media first, unknown modification times last, then by id
        pending.sort_by(|a, b| {
            b.file_modified
                .is_some()
                .cmp(&a.file_modified.is_some())
                .then_with(|| b.file_modified.cmp(&a.file_modified))
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(pending.into_iter().take(limit).map(Task::to_queued).collect())
    }

    async fn mark_processing(&mut self, ids: &[TaskId]) -> StoreResult<Vec<TaskId>> {
        let mut state = self.check_available()?;
        let now = Utc::now();
        let mut claimed = Vec::new();

        for id in ids {
            if let Some(task) = state.tasks.get_mut(id) {
                if task.status == TaskStatus::Pending {
                    task.status = TaskStatus::Processing;
                    task.started_at = Some(now);
                    task.updated_at = now;
                    claimed.push(id.clone());
                }
            }
        }

        Ok(claimed)
    }

    async fn save_result(
        &mut self,
        id: &TaskId,
        result: &serde_json::Value,
        version: &str,
    ) -> StoreResult<bool> {
        let mut state = self.check_available()?;
        let Some(task) = state.tasks.get_mut(id).filter(|t| t.status.can_finish()) else {
            return Ok(false);
        };

        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.result = Some(result.clone());
        task.analysis_version = Some(version.to_string());
        task.analyzed_at = Some(now);
        task.last_error = None;
        task.started_at = None;
        task.updated_at = now;
        Ok(true)
    }

    async fn record_failure(
        &mut self,
        id: &TaskId,
        error: &str,
        max_retries: u32,
    ) -> StoreResult<Option<FailureOutcome>> {
        let mut state = self.check_available()?;
        let error = truncate_error(error);
        let now = Utc::now();

        let Some(task) = state.tasks.get_mut(id).filter(|t| t.status.can_finish()) else {
            return Ok(None);
        };
        task.status = TaskStatus::Failed;
        task.last_error = Some(error.clone());
        task.retry_count += 1;
        task.started_at = None;
        task.updated_at = now;

        let retry_count = task.retry_count;
        let metadata = FailureMetadata {
            file_path: task.path.clone(),
            retry_count,
            max_retries,
        }
        .to_value();
        let entity_name = std::path::Path::new(&task.path.replace('\\', "/"))
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());

        let key = (AUDIO_ENTITY_TYPE.to_string(), id.as_str().to_string());
        state
            .failures
            .entry(key)
            .and_modify(|record| {
                record.error_message = error.clone();
                record.last_failed_at = now;
                record.retry_count = (record.retry_count + 1).max(retry_count);
                record.metadata = metadata.clone();
                record.resolved = false;
                record.skipped = false;
            })
            .or_insert_with(|| FailureRecord {
                entity_type: AUDIO_ENTITY_TYPE.to_string(),
                entity_id: id.as_str().to_string(),
                entity_name,
                error_message: error.clone(),
                last_failed_at: now,
                retry_count,
                metadata: metadata.clone(),
                resolved: false,
                skipped: false,
            });

        Ok(Some(FailureOutcome::new(retry_count, max_retries)))
    }

    async fn reclaim_stale(&mut self, threshold: Duration, max_retries: u32) -> StoreResult<u64> {
        let mut state = self.check_available()?;
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold)
            .map_err(|e| StoreError::config(e.to_string()))?;
        let mut reclaimed = 0;

        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Processing
                && task.processing_since() < now - threshold
                && task.retry_count < max_retries
            {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.retry_count += 1;
                task.updated_at = now;
                reclaimed += 1;
            }
        }

        Ok(reclaimed)
    }

    async fn retry_failed(&mut self, max_retries: u32) -> StoreResult<RetrySweep> {
        let mut state = self.check_available()?;
        let now = Utc::now();
        let mut sweep = RetrySweep::default();

        for task in state
            .tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Failed)
        {
            if task.retry_count < max_retries {
                task.status = TaskStatus::Pending;
                task.last_error = None;
                task.updated_at = now;
                sweep.requeued += 1;
            } else {
                sweep.permanently_failed += 1;
            }
        }

        Ok(sweep)
    }

    async fn worker_setting(&mut self) -> StoreResult<Option<i64>> {
        Ok(self.check_available()?.worker_setting)
    }

    async fn reconnect(&mut self) -> StoreResult<()> {
        self.lock().reconnects += 1;
        Ok(())
    }

    async fn close(&mut self) {
        self.lock().closes += 1;
    }
}
