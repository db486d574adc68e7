//! Audio analysis orchestrator.
//!
//! This crate provides:
//! - The processing loop with pause/resume/stop/resize control
//! - A crash-isolated pool of analyzer processes
//! - Queue-first job intake with a store fallback
//! - Reclamation sweeps for orphaned and retriable tasks
//! - The worker-process mode the pool launches

pub mod analyzer;
pub mod child;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod reclaim;
pub mod retry;
pub mod source;

pub use analyzer::{Analyzer, AnalyzerError, ProbeAnalyzer};
pub use config::WorkerConfig;
pub use error::{ErrorKind, WorkerError, WorkerResult};
pub use logging::TaskLogger;
pub use orchestrator::{Orchestrator, RunState, ShutdownHandle};
pub use pool::{BatchReport, PoolConfig, PoolStatus, TaskOutcome, WorkerCommand, WorkerPool};
pub use reclaim::{ReclaimReport, ReclamationEngine};
pub use source::JobSource;
