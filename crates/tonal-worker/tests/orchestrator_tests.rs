//! End-to-end tests of the processing loop with in-memory backends and
//! real worker processes.

use std::path::Path;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;

use tonal_models::{ControlMessage, Task, TaskId, TaskStatus, WorkerCount};
use tonal_queue::{MemoryControl, MemoryControlHandle, MemoryTaskQueue};
use tonal_store::MemoryTaskStore;
use tonal_worker::{Orchestrator, WorkerCommand, WorkerConfig};

const BIN: &str = env!("CARGO_BIN_EXE_tonal-worker");

struct Harness {
    store: MemoryTaskStore,
    queue: MemoryTaskQueue,
    control: MemoryControlHandle,
    media: TempDir,
}

impl Harness {
    fn new() -> Self {
        let (_, control) = MemoryControl::new();
        Self {
            store: MemoryTaskStore::new(),
            queue: MemoryTaskQueue::new(),
            control,
            media: tempfile::tempdir().unwrap(),
        }
    }

    /// Add a pending task, with a media file unless `missing`.
    fn add_task(&self, id: &str, missing: bool) {
        let name = format!("{id}.mp3");
        if !missing {
            std::fs::write(self.media.path().join(&name), format!("audio {id}")).unwrap();
        }
        self.store.insert(Task::new(id, name));
    }

    fn config(&self) -> WorkerConfig {
        WorkerConfig {
            batch_size: 10,
            sleep_interval: Duration::from_millis(50),
            num_workers: WorkerCount::clamped(2),
            max_retries: 3,
            batch_timeout: Duration::from_secs(60),
            task_timeout: Duration::from_secs(20),
            hung_task_limit: Duration::from_secs(60),
            worker_startup_timeout: Duration::from_secs(20),
            recreate_cooldown: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(10),
            idle_sweep_threshold: 3,
            error_recovery_threshold: 2,
            pause_poll: Duration::from_millis(20),
            music_path: self.media.path().to_path_buf(),
            ..Default::default()
        }
    }

    fn worker_command(&self) -> WorkerCommand {
        worker_command(self.media.path())
    }

    /// Start the loop; the returned control handle feeds it commands.
    fn start(&mut self, config: WorkerConfig, command: WorkerCommand) -> JoinHandle<()> {
        let (control, handle) = MemoryControl::new();
        self.control = handle;
        let pool_config = config.pool_config(command);
        let orchestrator = Orchestrator::new(
            config,
            pool_config,
            self.store.clone(),
            self.queue.clone(),
            control,
        );
        tokio::spawn(orchestrator.run())
    }

    fn status(&self, id: &str) -> TaskStatus {
        self.store.get(&TaskId::from(id)).unwrap().status
    }

    async fn stop(&self, handle: JoinHandle<()>) {
        assert!(self.control.publish(ControlMessage::Stop));
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("orchestrator did not stop")
            .expect("orchestrator panicked");
    }
}

fn worker_command(media_root: &Path) -> WorkerCommand {
    WorkerCommand::new(BIN)
        .arg("worker")
        .env("MUSIC_PATH", media_root.to_string_lossy())
        .env("RUST_LOG", "warn")
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Test that 25 pending tasks all settle with batches of 10 on 2 workers.
#[tokio::test]
async fn test_drains_all_pending_tasks() {
    let mut h = Harness::new();
    for i in 0..25 {
        h.add_task(&format!("track-{i:02}"), i % 5 == 0);
    }
    // Queue entries for tasks the store also offers must not double-dispatch.
    for i in 0..5 {
        let task = Task::new(format!("track-{i:02}"), format!("track-{i:02}.mp3"));
        h.queue.push(&task.to_queued());
        h.queue.push(&task.to_queued());
    }

    let mut config = h.config();
    config.max_retries = 1;
    let command = h.worker_command();
    let handle = h.start(config, command);

    let store = h.store.clone();
    assert!(
        eventually(|| store.count_status(TaskStatus::Completed) == 20
            && store.count_status(TaskStatus::Failed) == 5)
        .await
    );
    assert_eq!(h.store.count_status(TaskStatus::Pending), 0);
    assert_eq!(h.store.count_status(TaskStatus::Processing), 0);

    let done = h.store.get(&TaskId::from("track-01")).unwrap();
    assert_eq!(done.analysis_version.as_deref(), Some("probe-1"));
    assert!(done.result.is_some());
    assert!(done.analyzed_at.is_some());

    let failed = h.store.get(&TaskId::from("track-00")).unwrap();
    assert_eq!(failed.last_error.as_deref(), Some("File not found"));
    assert_eq!(failed.retry_count, 1);

    h.stop(handle).await;
}

/// Test that a task failing every attempt ends permanently failed.
#[tokio::test]
async fn test_permanent_failure_after_max_retries() {
    let mut h = Harness::new();
    h.add_task("broken", true);

    let mut config = h.config();
    config.idle_sweep_threshold = 1;
    let command = h.worker_command();
    let handle = h.start(config, command);

    let store = h.store.clone();
    let id = TaskId::from("broken");
    assert!(
        eventually(|| {
            let task = store.get(&id).unwrap();
            task.status == TaskStatus::Failed && task.retry_count == 3
        })
        .await
    );

    // Several more sweeps must leave it alone.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let task = h.store.get(&id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);

    let record = h.store.failure(&id).unwrap();
    assert_eq!(record.retry_count, 3);
    assert_eq!(record.error_message, "File not found");
    assert_eq!(record.metadata["maxRetries"], 3);
    assert!(!record.resolved);

    h.stop(handle).await;
}

/// Test that pause holds dispatch and resume releases it.
#[tokio::test]
async fn test_pause_and_resume() {
    let mut h = Harness::new();
    for i in 0..4 {
        h.add_task(&format!("p{i}"), false);
    }

    let command = h.worker_command();
    let config = h.config();
    let handle = h.start(config, command);
    h.control.publish_raw("pause");

    tokio::time::sleep(Duration::from_millis(500)).await;
    for i in 0..4 {
        assert_eq!(h.status(&format!("p{i}")), TaskStatus::Pending);
    }

    h.control.publish_raw(" resume\n");
    let store = h.store.clone();
    assert!(eventually(|| store.count_status(TaskStatus::Completed) == 4).await);

    h.stop(handle).await;
}

/// Test that stop releases the store and control subscription exactly once.
#[tokio::test]
async fn test_stop_releases_resources_once() {
    let mut h = Harness::new();
    let command = h.worker_command();
    let config = h.config();
    let handle = h.start(config, command);

    h.control.publish_raw("not a command");
    h.stop(handle).await;

    assert_eq!(h.store.close_count(), 1);
    assert_eq!(h.control.close_count(), 1);
}

/// Test that a resize command is applied while paused and work continues.
#[tokio::test]
async fn test_set_workers_while_paused() {
    let mut h = Harness::new();
    for i in 0..6 {
        h.add_task(&format!("r{i}"), false);
    }

    let command = h.worker_command();
    let config = h.config();
    let handle = h.start(config, command);
    h.control.publish(ControlMessage::Pause);
    h.control.publish_raw(r#"{"command":"set_workers","count":3}"#);
    h.control.publish_raw(r#"{"command":"set_workers","count":3}"#);
    h.control.publish(ControlMessage::Resume);

    let store = h.store.clone();
    assert!(eventually(|| store.count_status(TaskStatus::Completed) == 6).await);

    h.stop(handle).await;
}

/// Test that repeated store failures force a reconnect and processing resumes.
#[tokio::test]
async fn test_store_errors_force_recovery() {
    let mut h = Harness::new();
    for i in 0..3 {
        h.add_task(&format!("s{i}"), false);
    }
    h.store.fail_next(6);

    let command = h.worker_command();
    let config = h.config();
    let handle = h.start(config, command);

    let store = h.store.clone();
    assert!(eventually(|| store.count_status(TaskStatus::Completed) == 3).await);
    assert!(h.store.reconnect_count() >= 1);

    h.stop(handle).await;
}

/// Test that a crashed worker fails its task, the pool is rebuilt, and the
/// task later completes on a healthy worker.
#[tokio::test]
async fn test_recovers_from_worker_crash() {
    let mut h = Harness::new();
    h.add_task("victim", false);

    let marker = h.media.path().join("crashed-once");
    let body = format!(
        "if [ -e '{marker}' ]; then exec '{bin}' worker; fi; \
         touch '{marker}'; \
         echo '{{\"type\":\"ready\",\"pid\":0,\"version\":\"sh\"}}'; \
         read line; exit 3",
        marker = marker.display(),
        bin = BIN,
    );
    let command = WorkerCommand::new("sh")
        .arg("-c")
        .arg(body)
        .env("MUSIC_PATH", h.media.path().to_string_lossy())
        .env("RUST_LOG", "warn");

    let mut config = h.config();
    config.num_workers = WorkerCount::clamped(1);
    config.idle_sweep_threshold = 1;
    let handle = h.start(config, command);

    let store = h.store.clone();
    assert!(eventually(|| store.count_status(TaskStatus::Completed) == 1).await);

    let task = h.store.get(&TaskId::from("victim")).unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.analysis_version.as_deref(), Some("probe-1"));
    assert!(h.store.failure(&TaskId::from("victim")).is_some());

    h.stop(handle).await;
}

/// Test that an out-of-range worker setting in the store is clamped and used.
#[tokio::test]
async fn test_worker_count_from_settings() {
    let mut h = Harness::new();
    for i in 0..3 {
        h.add_task(&format!("w{i}"), false);
    }
    h.store.set_worker_setting(Some(20));

    let command = h.worker_command();
    let config = h.config();
    let handle = h.start(config, command);

    let store = h.store.clone();
    assert!(eventually(|| store.count_status(TaskStatus::Completed) == 3).await);

    h.stop(handle).await;
}

/// Test that a task still running when a sibling worker crashes is failed
/// through the ledger instead of being left in processing.
#[tokio::test]
async fn test_pool_break_fails_unfinished_tasks() {
    let mut h = Harness::new();
    h.add_task("crash", false);
    let mut held = Task::new("held", "held.mp3");
    held.retry_count = 2;
    h.store.insert(held);

    let body = r#"echo '{"type":"ready","pid":0,"version":"sh"}'
        while read line; do
            case "$line" in
                *crash*) exit 3 ;;
                *) exec sleep 30 ;;
            esac
        done"#;
    let command = WorkerCommand::new("sh").arg("-c").arg(body);

    let config = h.config();
    let handle = h.start(config, command);

    let store = h.store.clone();
    let id = TaskId::from("held");
    assert!(eventually(|| store.get(&id).unwrap().status == TaskStatus::Failed).await);

    let task = h.store.get(&id).unwrap();
    assert_eq!(task.retry_count, 3);
    let record = h.store.failure(&id).unwrap();
    assert_eq!(record.retry_count, 3);
    assert!(record.error_message.contains("pool broke"));

    h.stop(handle).await;
}
