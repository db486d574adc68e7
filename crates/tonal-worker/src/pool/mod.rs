//! Process-isolated worker pool.
//!
//! Each worker is a separate OS process driven by one tokio task. Jobs sit
//! in a shared channel and idle drivers take them one at a time. A worker
//! that crashes, fails to start, or hangs past the limit marks the whole
//! pool broken; the orchestrator then rebuilds it with [`WorkerPool::recreate`].

mod process;
pub mod protocol;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use tonal_models::{QueuedTask, TaskId, WorkerCount};

use crate::metrics;
use process::{run_driver, Job, WorkerReply};
use protocol::WorkerRequest;

pub use process::WorkerCommand;

/// Settings shared by every pool generation.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub command: WorkerCommand,
    pub task_timeout: Duration,
    pub batch_timeout: Duration,
    pub hung_task_limit: Duration,
    pub startup_timeout: Duration,
    pub health_check_timeout: Duration,
    pub recreate_cooldown: Duration,
    pub shutdown_timeout: Duration,
}

/// Final state of one submitted task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed {
        result: serde_json::Value,
        version: String,
    },
    Failed(String),
    TimedOut(Duration),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Completed { .. })
    }

    /// Message recorded against the task when it did not complete.
    pub fn error_message(&self) -> Option<String> {
        match self {
            TaskOutcome::Completed { .. } => None,
            TaskOutcome::Failed(e) => Some(e.clone()),
            TaskOutcome::TimedOut(d) => Some(format!("Timeout after {}s", d.as_secs())),
        }
    }
}

/// Pool health as seen by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Healthy,
    Broken,
}

/// Collected results of one batch.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Tasks with a final outcome, in arrival order
    pub results: Vec<(QueuedTask, TaskOutcome)>,
    /// Tasks still running when the pool broke
    pub unresolved: Vec<QueuedTask>,
    pub broken: bool,
}

/// Receipt for a submitted task.
pub struct TaskHandle {
    task: QueuedTask,
    reply: oneshot::Receiver<WorkerReply>,
}

impl TaskHandle {
    pub fn task(&self) -> &QueuedTask {
        &self.task
    }

    async fn outcome(self) -> (QueuedTask, TaskOutcome) {
        let outcome = match self.reply.await {
            Ok(WorkerReply::Outcome(outcome)) => outcome,
            Ok(WorkerReply::Pong) => TaskOutcome::Failed("unexpected pong".to_string()),
            Err(_) => TaskOutcome::Failed("worker pool shut down before the task ran".to_string()),
        };
        (self.task, outcome)
    }
}

/// Broken flag shared by the drivers of one pool generation.
#[derive(Clone)]
pub(crate) struct PoolHealth {
    tx: Arc<watch::Sender<bool>>,
}

impl PoolHealth {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn mark_broken(&self, reason: String) {
        error!("Worker pool broken: {}", reason);
        self.tx.send_replace(true);
    }

    fn is_broken(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// One generation of worker processes.
struct Generation {
    jobs: Option<mpsc::UnboundedSender<Job>>,
    drivers: Vec<JoinHandle<()>>,
    health: PoolHealth,
}

impl Generation {
    fn start(config: &Arc<PoolConfig>, size: WorkerCount) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        let health = PoolHealth::new();

        let drivers = (0..size.get())
            .map(|slot| {
                tokio::spawn(run_driver(
                    slot,
                    Arc::clone(config),
                    Arc::clone(&rx),
                    health.clone(),
                ))
            })
            .collect();

        Self {
            jobs: Some(tx),
            drivers,
            health,
        }
    }

    /// Close intake and wait for queued work to finish.
    async fn drain(mut self, limit: Duration) {
        self.jobs.take();
        let drivers = std::mem::take(&mut self.drivers);
        let aborts: Vec<_> = drivers.iter().map(|d| d.abort_handle()).collect();

        if timeout(limit, futures::future::join_all(drivers)).await.is_err() {
            warn!("Worker pool did not drain within {:?}, killing workers", limit);
            for abort in aborts {
                abort.abort();
            }
        }
    }

    /// Stop immediately; dropping the drivers kills their processes.
    fn teardown(mut self) {
        self.jobs.take();
        for driver in self.drivers.drain(..) {
            driver.abort();
        }
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        for driver in &self.drivers {
            driver.abort();
        }
    }
}

/// Fixed-size set of isolated worker processes.
pub struct WorkerPool {
    config: Arc<PoolConfig>,
    size: WorkerCount,
    current: Generation,
}

impl WorkerPool {
    /// Launch `size` workers. Never fails: a worker that cannot start
    /// marks the pool broken instead.
    pub fn start(config: PoolConfig, size: WorkerCount) -> Self {
        let config = Arc::new(config);
        let current = Generation::start(&config, size);
        info!("Worker pool started with {} workers", size);
        metrics::set_pool_workers(size.get());
        Self {
            config,
            size,
            current,
        }
    }

    pub fn size(&self) -> WorkerCount {
        self.size
    }

    pub fn is_broken(&self) -> bool {
        self.current.health.is_broken()
    }

    /// Queue a task for the next idle worker. Never blocks.
    pub fn submit(&self, task: QueuedTask) -> TaskHandle {
        let (tx, rx) = oneshot::channel();
        let request = WorkerRequest::Analyze {
            id: task.id.clone(),
            path: task.path.clone(),
        };
        if let Some(jobs) = &self.current.jobs {
            // A closed channel drops the reply sender, which the handle
            // reports as a failure.
            let _ = jobs.send(Job { request, reply: tx });
        }
        TaskHandle { task, reply: rx }
    }

    /// Wait for every handle, under the batch deadline.
    ///
    /// Returns early if the pool breaks; tasks still running at that point
    /// are listed in [`BatchReport::unresolved`].
    pub async fn await_batch(&self, handles: Vec<TaskHandle>) -> BatchReport {
        let mut pending: HashMap<TaskId, QueuedTask> = handles
            .iter()
            .map(|h| (h.task.id.clone(), h.task.clone()))
            .collect();
        let mut outcomes: FuturesUnordered<_> = handles.into_iter().map(|h| h.outcome()).collect();
        let mut broken_rx = self.current.health.subscribe();
        let deadline = Instant::now() + self.config.batch_timeout;
        let mut report = BatchReport::default();

        loop {
            tokio::select! {
                next = outcomes.next() => match next {
                    Some((task, outcome)) => {
                        pending.remove(&task.id);
                        report.results.push((task, outcome));
                    }
                    None => break,
                },
                _ = broken_rx.wait_for(|broken| *broken) => {
                    // Replies already sent (e.g. the crashed task's) still count.
                    while let Some(Some((task, outcome))) = outcomes.next().now_or_never() {
                        pending.remove(&task.id);
                        report.results.push((task, outcome));
                    }
                    report.unresolved = pending.into_values().collect();
                    report.broken = true;
                    return report;
                }
                _ = sleep_until(deadline) => {
                    warn!(
                        "Batch deadline of {:?} passed with {} tasks outstanding",
                        self.config.batch_timeout,
                        pending.len()
                    );
                    for (_, task) in pending.drain() {
                        report
                            .results
                            .push((task, TaskOutcome::TimedOut(self.config.batch_timeout)));
                    }
                    break;
                }
            }
        }

        // A worker may have died right after delivering its reply.
        report.broken = self.is_broken();
        report
    }

    /// Probe the pool with a no-op request.
    pub async fn health_check(&self) -> PoolStatus {
        if self.is_broken() {
            return PoolStatus::Broken;
        }
        let Some(jobs) = &self.current.jobs else {
            return PoolStatus::Broken;
        };

        let (tx, rx) = oneshot::channel();
        if jobs
            .send(Job {
                request: WorkerRequest::Ping,
                reply: tx,
            })
            .is_err()
        {
            return PoolStatus::Broken;
        }

        match timeout(self.config.health_check_timeout, rx).await {
            Ok(Ok(WorkerReply::Pong)) if !self.is_broken() => PoolStatus::Healthy,
            Ok(_) => PoolStatus::Broken,
            Err(_) => {
                warn!(
                    "Worker pool did not answer a ping within {:?}",
                    self.config.health_check_timeout
                );
                PoolStatus::Broken
            }
        }
    }

    /// Switch to `count` workers.
    ///
    /// Returns `false` when the size is unchanged. Otherwise the new
    /// generation starts first and the old one drains completely, so
    /// nothing already submitted is lost.
    pub async fn resize(&mut self, count: WorkerCount) -> bool {
        if count == self.size {
            debug!("Worker pool already has {} workers", count);
            return false;
        }

        info!("Resizing worker pool: {} -> {}", self.size, count);
        let old = std::mem::replace(&mut self.current, Generation::start(&self.config, count));
        self.size = count;
        metrics::set_pool_workers(count.get());
        old.drain(self.config.shutdown_timeout).await;
        info!("Worker pool resized to {} workers", count);
        true
    }

    /// Replace a broken pool with a fresh one of the same size.
    pub async fn recreate(&mut self) {
        warn!("Recreating worker pool ({} workers)", self.size);
        let old = std::mem::replace(
            &mut self.current,
            Generation {
                jobs: None,
                drivers: Vec::new(),
                health: PoolHealth::new(),
            },
        );
        old.teardown();

        tokio::time::sleep(self.config.recreate_cooldown).await;

        self.current = Generation::start(&self.config, self.size);
        metrics::record_pool_recreated();
        info!("Worker pool recreated");
    }

    /// Let in-flight work finish, then stop every worker.
    pub async fn shutdown(self) {
        info!("Shutting down worker pool");
        let WorkerPool { config, current, .. } = self;
        current.drain(config.shutdown_timeout).await;
        metrics::set_pool_workers(0);
        info!("Worker pool stopped");
    }
}
