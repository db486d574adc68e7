//! The processing loop.
//!
//! One cooperative loop owns the store, the job source, the control
//! subscription and the worker pool. Every tick polls control once, then
//! either waits (paused), or pulls and dispatches one batch (running).
//! Errors never leave the loop; [`Orchestrator::run`] returns only after a
//! stop command or a shutdown signal.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn, Instrument};

use tonal_models::{ControlMessage, QueuedTask, TaskId, WorkerCount};
use tonal_queue::{ControlChannel, TaskQueue};
use tonal_store::TaskStore;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::TaskLogger;
use crate::metrics;
use crate::pool::{BatchReport, PoolConfig, PoolStatus, TaskOutcome, WorkerPool};
use crate::reclaim::ReclamationEngine;
use crate::retry::ErrorStreak;
use crate::source::JobSource;

const OPERATION: &str = "audio_analysis";

/// Recorded against tasks still unfinished when the pool broke.
const POOL_BROKE: &str = "worker pool broke before the task finished";

/// Consecutive loop errors logged in full before suppression.
const MAX_LOGGED_ERRORS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopped,
}

/// Requests a cooperative stop from outside the loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

pub struct Orchestrator<S, Q, C> {
    config: WorkerConfig,
    pool_config: PoolConfig,
    store: S,
    source: JobSource<Q>,
    control: C,
    reclaimer: ReclamationEngine,
    state: RunState,
    idle_ticks: u32,
    errors: ErrorStreak,
    shutdown: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S, Q, C> Orchestrator<S, Q, C>
where
    S: TaskStore,
    Q: TaskQueue,
    C: ControlChannel,
{
    pub fn new(config: WorkerConfig, pool_config: PoolConfig, store: S, queue: Q, control: C) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reclaimer = ReclamationEngine::new(config.stale_processing, config.max_retries);
        let errors = ErrorStreak::new(MAX_LOGGED_ERRORS, config.error_recovery_threshold);

        Self {
            config,
            pool_config,
            store,
            source: JobSource::new(queue),
            control,
            reclaimer,
            state: RunState::Running,
            idle_ticks: 0,
            errors,
            shutdown: Arc::new(shutdown),
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Run until stopped, then release every resource exactly once.
    pub async fn run(mut self) {
        let mut pool = self.startup().await;

        while self.state != RunState::Stopped {
            match self.tick(&mut pool).await {
                Ok(()) => self.errors.succeeded(),
                Err(e) => self.handle_error(e, &mut pool).await,
            }
        }

        info!("Stopping worker");
        pool.shutdown().await;
        self.control.close();
        self.store.close().await;
        info!("Worker stopped");
    }

    async fn startup(&mut self) -> WorkerPool {
        info!(
            "Starting orchestrator: batch size {}, max retries {}, stale after {} min",
            self.config.batch_size,
            self.config.max_retries,
            self.config.stale_processing.as_secs() / 60
        );

        if let Err(e) = self.reclaimer.run_all(&mut self.store).await {
            warn!("Startup reclamation failed: {}", e);
        }

        let size = self.initial_worker_count().await;
        WorkerPool::start(self.pool_config.clone(), size)
    }

    async fn initial_worker_count(&mut self) -> WorkerCount {
        match self.store.worker_setting().await {
            Ok(Some(count)) => {
                let count = WorkerCount::clamped(count);
                info!("Using {} workers from system settings", count);
                count
            }
            Ok(None) => self.config.num_workers,
            Err(e) => {
                warn!(
                    "Could not read worker setting, using {}: {}",
                    self.config.num_workers, e
                );
                self.config.num_workers
            }
        }
    }

    async fn tick(&mut self, pool: &mut WorkerPool) -> WorkerResult<()> {
        if *self.shutdown_rx.borrow() {
            info!("Shutdown requested");
            self.state = RunState::Stopped;
            return Ok(());
        }

        if let Some(message) = self.control.poll() {
            self.apply_control(message, pool).await;
        }

        match self.state {
            RunState::Stopped => Ok(()),
            RunState::Paused => {
                self.wait(self.config.pause_poll).await;
                Ok(())
            }
            RunState::Running => self.dispatch(pool).await,
        }
    }

    async fn apply_control(&mut self, message: ControlMessage, pool: &mut WorkerPool) {
        match message {
            ControlMessage::SetWorkers(count) => {
                pool.resize(count).await;
            }
            ControlMessage::Pause => {
                if self.state == RunState::Running {
                    info!("Pausing task dispatch");
                    self.state = RunState::Paused;
                }
            }
            ControlMessage::Resume => {
                if self.state == RunState::Paused {
                    info!("Resuming task dispatch");
                    self.state = RunState::Running;
                }
            }
            ControlMessage::Stop => {
                info!("Stop command received");
                self.state = RunState::Stopped;
            }
            ControlMessage::Ignored => debug!("Ignoring unrecognized control message"),
        }
    }

    async fn dispatch(&mut self, pool: &mut WorkerPool) -> WorkerResult<()> {
        if pool.is_broken() {
            return Err(WorkerError::pool_broken("pool unavailable before dispatch"));
        }

        let batch = self
            .source
            .next_batch(&mut self.store, self.config.batch_size)
            .await?;

        if batch.is_empty() {
            self.idle_ticks += 1;
            if self.idle_ticks >= self.config.idle_sweep_threshold {
                info!(
                    "No pending tasks after {} checks, running reclamation sweeps",
                    self.idle_ticks
                );
                self.idle_ticks = 0;
                self.reclaimer.run_all(&mut self.store).await?;
            }
            self.wait(self.config.sleep_interval).await;
            return Ok(());
        }

        self.idle_ticks = 0;
        self.process_batch(batch, pool).await
    }

    async fn process_batch(&mut self, batch: Vec<QueuedTask>, pool: &mut WorkerPool) -> WorkerResult<()> {
        let ids: Vec<TaskId> = batch.iter().map(|t| t.id.clone()).collect();
        let claimed: HashSet<TaskId> = self.store.mark_processing(&ids).await?.into_iter().collect();

        let (tasks, skipped): (Vec<_>, Vec<_>) =
            batch.into_iter().partition(|t| claimed.contains(&t.id));
        if !skipped.is_empty() {
            debug!("Skipping {} tasks that are no longer pending", skipped.len());
        }
        if tasks.is_empty() {
            return Ok(());
        }

        info!("Processing batch of {} tasks", tasks.len());
        let started = Instant::now();
        metrics::record_tasks_dispatched(tasks.len());

        let handles = tasks
            .into_iter()
            .map(|task| {
                TaskLogger::new(&task.id, OPERATION).log_start(&task.path);
                pool.submit(task)
            })
            .collect();
        let BatchReport {
            results,
            unresolved,
            broken,
        } = pool.await_batch(handles).await;

        if !unresolved.is_empty() {
            warn!(
                "Worker pool broke with {} tasks unfinished, failing them",
                unresolved.len()
            );
        }
        let abandoned = unresolved
            .into_iter()
            .map(|task| (task, TaskOutcome::Failed(POOL_BROKE.to_string())));

        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut first_error = None;
        for (task, outcome) in results.into_iter().chain(abandoned) {
            let span = TaskLogger::new(&task.id, OPERATION).create_span();
            match self.persist(&task, outcome).instrument(span).await {
                Ok(true) => succeeded += 1,
                Ok(false) => failed += 1,
                Err(e) => {
                    error!(task_id = %task.id, "Failed to persist task outcome: {}", e);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        let elapsed = started.elapsed().as_secs_f64();
        metrics::record_batch_duration(elapsed);
        let rate = if elapsed > 0.0 {
            (succeeded + failed) as f64 / elapsed
        } else {
            0.0
        };
        info!(
            "Batch complete: {} succeeded, {} failed in {:.1}s ({:.1} tasks/sec)",
            succeeded, failed, elapsed, rate
        );

        if broken {
            return Err(WorkerError::pool_broken("worker failure during batch"));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Write one outcome. Returns whether the task succeeded.
    async fn persist(&mut self, task: &QueuedTask, outcome: TaskOutcome) -> WorkerResult<bool> {
        let logger = TaskLogger::new(&task.id, OPERATION);

        if let TaskOutcome::Completed { result, version } = &outcome {
            if self.store.save_result(&task.id, result, version).await? {
                logger.log_completion(&task.path);
                metrics::record_task_completed();
            } else {
                logger.log_warning("result discarded, task was no longer processing");
            }
            return Ok(true);
        }

        let reason = match outcome {
            TaskOutcome::TimedOut(_) => "timeout",
            _ => "error",
        };
        metrics::record_task_failed(reason);
        let message = outcome.error_message().unwrap_or_default();

        match self
            .store
            .record_failure(&task.id, &message, self.config.max_retries)
            .await?
        {
            Some(recorded) if recorded.permanent => {
                logger.log_permanent_failure(recorded.retry_count, &message);
                metrics::record_task_permanently_failed();
            }
            Some(recorded) => {
                logger.log_retry(recorded.retry_count, self.config.max_retries, &message)
            }
            None => logger.log_warning("failure discarded, task was no longer processing"),
        }
        Ok(false)
    }

    async fn handle_error(&mut self, error: WorkerError, pool: &mut WorkerPool) {
        metrics::record_loop_error(error.kind().as_str());

        if error.is_pool_broken() {
            error!("{}", error);
            pool.recreate().await;
            if let Err(e) = self.reclaimer.sweep_stale(&mut self.store).await {
                warn!("Stale sweep after pool recreation failed: {}", e);
            }
            return;
        }

        if self.errors.failed() {
            error!("Worker loop error: {}", error);
        }

        if self.errors.needs_recovery() {
            self.recover(pool).await;
            self.errors.clear();
        }

        self.wait(self.config.sleep_interval).await;
    }

    async fn recover(&mut self, pool: &mut WorkerPool) {
        warn!(
            "{} consecutive errors, forcing recovery",
            self.errors.count()
        );

        if let Err(e) = self.store.reconnect().await {
            error!("Store reconnect failed: {}", e);
        }
        if let Err(e) = self.reclaimer.run_all(&mut self.store).await {
            warn!("Recovery reclamation failed: {}", e);
        }
        if pool.health_check().await == PoolStatus::Broken {
            pool.recreate().await;
        }
    }

    /// Sleep, waking early on a shutdown signal.
    async fn wait(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown_rx.wait_for(|stop| *stop) => {}
        }
    }
}
