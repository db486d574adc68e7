//! Durable task state for the tonal orchestrator.
//!
//! This crate provides:
//! - The [`TaskStore`] contract the orchestrator drives
//! - A PostgreSQL implementation with an idempotent schema migration
//! - An in-memory implementation with the same transition rules

pub mod config;
pub mod error;
pub mod memory;
pub mod migrations;
pub mod postgres;
pub mod store;

pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryTaskStore;
pub use migrations::MigrationRunner;
pub use postgres::PgTaskStore;
pub use store::{FailureOutcome, RetrySweep, TaskStore};
