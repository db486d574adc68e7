//! Store configuration.

use std::time::Duration;

use crate::error::{StoreError, StoreResult};

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// How long to wait for a pooled connection
    pub acquire_timeout: Duration,
}

impl StoreConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }

    /// Create config from environment variables. `DATABASE_URL` is required.
    pub fn from_env() -> StoreResult<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| StoreError::config("DATABASE_URL not set"))?;

        Ok(Self {
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            ..Self::new(database_url)
        })
    }
}
