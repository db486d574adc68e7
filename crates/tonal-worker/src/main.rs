//! Audio analysis worker binary.
//!
//! `tonal-worker` runs the orchestrator; `tonal-worker worker` runs one
//! analyzer process speaking the pool protocol on stdin/stdout.

use std::time::Duration;

use tracing::{error, info, warn};

use tonal_queue::{QueueConfig, RedisControlChannel, RedisTaskQueue};
use tonal_store::{PgTaskStore, StoreConfig};
use tonal_worker::logging::{init_tracing, LogTarget};
use tonal_worker::retry::Backoff;
use tonal_worker::{child, metrics, Orchestrator, ProbeAnalyzer, WorkerCommand, WorkerConfig};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    if std::env::args().nth(1).as_deref() == Some("worker") {
        run_worker_process().await;
        return;
    }

    init_tracing(LogTarget::Stdout);
    info!("Starting tonal-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(port) = config.metrics_port {
        match metrics::install_exporter(port) {
            Ok(()) => info!("Serving metrics on port {}", port),
            Err(e) => warn!("Failed to install metrics exporter: {}", e),
        }
    }

    let store_config = match StoreConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Invalid store configuration: {}", e);
            std::process::exit(1);
        }
    };

    let connect = Backoff::new("Database connect")
        .retries(5)
        .initial(Duration::from_secs(1));
    let store = match connect.run(|| PgTaskStore::connect(store_config.clone())).await {
        Ok(store) => store,
        Err(gave_up) => {
            error!(
                "Failed to connect to database after {} attempts: {}",
                gave_up.attempts, gave_up.error
            );
            std::process::exit(1);
        }
    };
    if let Err(e) = store.run_migrations().await {
        error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }

    let queue_config = QueueConfig::from_env();
    let queue = match RedisTaskQueue::new(queue_config.clone()) {
        Ok(q) => q,
        Err(e) => {
            error!("Failed to create task queue: {}", e);
            std::process::exit(1);
        }
    };

    let control = match RedisControlChannel::subscribe(&queue_config).await {
        Ok(c) => Some(c),
        Err(e) => {
            warn!("Control channel unavailable, running without live control: {}", e);
            None
        }
    };

    let command = match WorkerCommand::current_exe() {
        Ok(c) => c
            .thread_caps(config.threads_per_worker)
            .env("MUSIC_PATH", config.music_path.to_string_lossy()),
        Err(e) => {
            error!("Cannot locate own executable: {}", e);
            std::process::exit(1);
        }
    };
    let pool_config = config.pool_config(command);

    let orchestrator = Orchestrator::new(config, pool_config, store, queue, control);

    let shutdown = orchestrator.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown.shutdown();
    });

    orchestrator.run().await;

    info!("Worker shutdown complete");
}

async fn run_worker_process() {
    init_tracing(LogTarget::Stderr);

    let media_root = WorkerConfig::from_env().music_path;
    let result = tokio::task::spawn_blocking(move || {
        child::run_worker::<ProbeAnalyzer>(&media_root)
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!("Worker process failed: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Worker process panicked: {}", e);
            std::process::exit(1);
        }
    }
}
