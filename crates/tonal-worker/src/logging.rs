//! Structured logging utilities.
//!
//! Tracing setup for both process modes, plus a per-task logger that
//! keeps task id and operation on every lifecycle event.

use tracing::{info, warn, Span};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use tonal_models::TaskId;

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Orchestrator output
    Stdout,
    /// Worker processes; their stdout carries the protocol
    Stderr,
}

/// Install the global subscriber.
///
/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` overrides the
/// default `tonal=info` filter.
pub fn init_tracing(target: LogTarget) {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tonal=info"));

    let writer = match target {
        LogTarget::Stdout => BoxMakeWriter::new(std::io::stdout),
        LogTarget::Stderr => BoxMakeWriter::new(std::io::stderr),
    };

    let fmt_layer = if use_json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer()
            .with_ansi(target == LogTarget::Stdout)
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(writer)
            .boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init();
}

/// Task logger for structured logging with consistent formatting.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    task_id: String,
    operation: String,
}

impl TaskLogger {
    pub fn new(task_id: &TaskId, operation: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Log the start of a task operation.
    pub fn log_start(&self, message: &str) {
        info!(
            task_id = %self.task_id,
            operation = %self.operation,
            "Task started: {}", message
        );
    }

    /// Log a failure that will be retried.
    pub fn log_retry(&self, attempt: u32, max_retries: u32, error: &str) {
        warn!(
            task_id = %self.task_id,
            operation = %self.operation,
            "Task failed (attempt {}/{}), will retry: {}", attempt, max_retries, error
        );
    }

    /// Log a failure that has exhausted its retries.
    pub fn log_permanent_failure(&self, attempts: u32, error: &str) {
        warn!(
            task_id = %self.task_id,
            operation = %self.operation,
            "Task permanently failed after {} attempts: {}", attempts, error
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            task_id = %self.task_id,
            operation = %self.operation,
            "Task warning: {}", message
        );
    }

    /// Log the completion of a task operation.
    pub fn log_completion(&self, message: &str) {
        info!(
            task_id = %self.task_id,
            operation = %self.operation,
            "Task completed: {}", message
        );
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Create a tracing span for this task.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "task",
            task_id = %self.task_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_logger_creation() {
        let id = TaskId::from("track-42");
        let logger = TaskLogger::new(&id, "analysis");

        assert_eq!(logger.task_id(), "track-42");
        assert_eq!(logger.operation(), "analysis");
    }
}
