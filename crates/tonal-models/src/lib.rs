//! Shared data models for the tonal analysis orchestrator.
//!
//! This crate provides Serde-serializable types for:
//! - Analysis tasks and their lifecycle status
//! - Push-queue envelopes
//! - Failure ledger records
//! - Runtime control messages

pub mod control;
pub mod failure;
pub mod task;

// Re-export common types
pub use control::{ControlMessage, WorkerCount};
pub use failure::{FailureMetadata, FailureRecord, AUDIO_ENTITY_TYPE};
pub use task::{truncate_error, QueuedTask, Task, TaskId, TaskStatus, UnknownStatus, MAX_ERROR_LEN};
