//! Redis-backed job intake and runtime control.
//!
//! This crate provides:
//! - The push queue the orchestrator drains before falling back to the store
//! - The pub/sub control topic (pause/resume/stop/set_workers)
//! - In-memory stand-ins for both, used by tests and local runs

pub mod control;
pub mod error;
pub mod memory;
pub mod queue;

pub use control::{ControlChannel, RedisControlChannel};
pub use error::{QueueError, QueueResult};
pub use memory::{MemoryControl, MemoryControlHandle, MemoryTaskQueue};
pub use queue::{decode_envelope, QueueConfig, RedisTaskQueue, TaskQueue};
