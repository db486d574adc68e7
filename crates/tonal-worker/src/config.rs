//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use tonal_models::WorkerCount;

use crate::pool::{PoolConfig, WorkerCommand};

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum tasks per dispatch cycle
    pub batch_size: usize,
    /// Backoff after an idle or failed tick
    pub sleep_interval: Duration,
    /// Initial pool size when no stored setting exists
    pub num_workers: WorkerCount,
    /// Ceiling for both reclamation passes and failure finalization
    pub max_retries: u32,
    /// Age after which a `processing` task is presumed orphaned
    pub stale_processing: Duration,
    /// Overall deadline for one dispatched batch
    pub batch_timeout: Duration,
    /// Deadline for a single task once a worker has started it
    pub task_timeout: Duration,
    /// Abandoned work still running after this long marks the pool broken
    pub hung_task_limit: Duration,
    /// Time a worker process gets to load its context and report ready
    pub worker_startup_timeout: Duration,
    /// Ping timeout for pool health checks
    pub health_check_timeout: Duration,
    /// Pause between tearing down a broken pool and building a new one
    pub recreate_cooldown: Duration,
    /// Bound on the graceful drain at shutdown
    pub shutdown_timeout: Duration,
    /// Consecutive empty batches before the reclamation sweeps run
    pub idle_sweep_threshold: u32,
    /// Consecutive failed ticks before forced recovery
    pub error_recovery_threshold: u32,
    /// Sleep between control checks while paused
    pub pause_poll: Duration,
    /// Thread cap exported to each worker process
    pub threads_per_worker: usize,
    /// Root that task paths are resolved against inside workers
    pub music_path: PathBuf,
    /// Prometheus exporter port, if metrics should be served
    pub metrics_port: Option<u16>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            sleep_interval: Duration::from_secs(5),
            num_workers: WorkerCount::default(),
            max_retries: 3,
            stale_processing: Duration::from_secs(10 * 60),
            batch_timeout: Duration::from_secs(300),
            task_timeout: Duration::from_secs(60),
            hung_task_limit: Duration::from_secs(600),
            worker_startup_timeout: Duration::from_secs(120),
            health_check_timeout: Duration::from_secs(5),
            recreate_cooldown: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(60),
            idle_sweep_threshold: 10,
            error_recovery_threshold: 5,
            pause_poll: Duration::from_secs(1),
            threads_per_worker: 1,
            music_path: PathBuf::from("/music"),
            metrics_port: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: env_parse::<usize>("BATCH_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            sleep_interval: env_secs("SLEEP_INTERVAL").unwrap_or(defaults.sleep_interval),
            num_workers: env_parse::<i64>("NUM_WORKERS")
                .map(WorkerCount::clamped)
                .unwrap_or(defaults.num_workers),
            max_retries: env_parse("MAX_RETRIES").unwrap_or(defaults.max_retries),
            stale_processing: env_parse::<u64>("STALE_PROCESSING_MINUTES")
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(defaults.stale_processing),
            batch_timeout: env_secs("BATCH_TIMEOUT_SECS").unwrap_or(defaults.batch_timeout),
            task_timeout: env_secs("TASK_TIMEOUT_SECS").unwrap_or(defaults.task_timeout),
            hung_task_limit: env_secs("HUNG_TASK_LIMIT_SECS").unwrap_or(defaults.hung_task_limit),
            worker_startup_timeout: env_secs("WORKER_STARTUP_TIMEOUT_SECS")
                .unwrap_or(defaults.worker_startup_timeout),
            health_check_timeout: env_secs("HEALTH_CHECK_TIMEOUT_SECS")
                .unwrap_or(defaults.health_check_timeout),
            recreate_cooldown: env_secs("RECREATE_COOLDOWN_SECS")
                .unwrap_or(defaults.recreate_cooldown),
            shutdown_timeout: env_secs("SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or(defaults.shutdown_timeout),
            idle_sweep_threshold: env_parse("IDLE_SWEEP_THRESHOLD")
                .unwrap_or(defaults.idle_sweep_threshold),
            error_recovery_threshold: env_parse("ERROR_RECOVERY_THRESHOLD")
                .unwrap_or(defaults.error_recovery_threshold),
            pause_poll: env_parse::<u64>("PAUSE_POLL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.pause_poll),
            threads_per_worker: env_parse::<usize>("THREADS_PER_WORKER")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.threads_per_worker),
            music_path: std::env::var("MUSIC_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.music_path),
            metrics_port: env_parse("METRICS_PORT"),
        }
    }

    /// Pool settings for workers launched with `command`.
    pub fn pool_config(&self, command: WorkerCommand) -> PoolConfig {
        PoolConfig {
            command,
            task_timeout: self.task_timeout,
            batch_timeout: self.batch_timeout,
            hung_task_limit: self.hung_task_limit,
            startup_timeout: self.worker_startup_timeout,
            health_check_timeout: self.health_check_timeout,
            recreate_cooldown: self.recreate_cooldown,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = WorkerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.sleep_interval, Duration::from_secs(5));
        assert_eq!(config.num_workers.get(), 2);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stale_processing, Duration::from_secs(600));
        assert_eq!(config.idle_sweep_threshold, 10);
    }

    #[test]
    fn test_pool_config_carries_deadlines() {
        let config = WorkerConfig {
            task_timeout: Duration::from_secs(7),
            batch_timeout: Duration::from_secs(70),
            ..Default::default()
        };
        let pool = config.pool_config(WorkerCommand::new("/bin/true"));
        assert_eq!(pool.task_timeout, Duration::from_secs(7));
        assert_eq!(pool.batch_timeout, Duration::from_secs(70));
    }
}
