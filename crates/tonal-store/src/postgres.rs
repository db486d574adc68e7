//! PostgreSQL task store.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info, warn};

use tonal_models::{
    truncate_error, FailureMetadata, QueuedTask, TaskId, AUDIO_ENTITY_TYPE,
};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::migrations::MigrationRunner;
use crate::store::{FailureOutcome, RetrySweep, TaskStore};

/// Task store backed by a sqlx connection pool.
pub struct PgTaskStore {
    config: StoreConfig,
    pool: Option<PgPool>,
}

impl PgTaskStore {
    /// Connect to the database.
    pub async fn connect(config: StoreConfig) -> StoreResult<Self> {
        let pool = Self::open_pool(&config).await?;
        info!("Connected to PostgreSQL");
        Ok(Self {
            config,
            pool: Some(pool),
        })
    }

    /// Create a store around an existing pool.
    pub fn from_pool(config: StoreConfig, pool: PgPool) -> Self {
        Self {
            config,
            pool: Some(pool),
        }
    }

    async fn open_pool(config: &StoreConfig) -> StoreResult<PgPool> {
        PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(|e| StoreError::connection_failed(e.to_string()))
    }

    /// Create tables if they do not exist yet.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        MigrationRunner::new(self.pool()?.clone()).run_migrations().await
    }

    fn pool(&self) -> StoreResult<&PgPool> {
        self.pool.as_ref().ok_or(StoreError::Closed)
    }
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}

fn entity_name(path: &str) -> Option<String> {
    Path::new(&path.replace('\\', "/"))
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn fetch_pending(&mut self, limit: usize) -> StoreResult<Vec<QueuedTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, path
            FROM analysis_tasks
            WHERE status = 'pending'
            ORDER BY file_modified DESC NULLS LAST, id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(self.pool()?)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let path: String = row.try_get("path")?;
                Ok(QueuedTask::new(id, path))
            })
            .collect()
    }

    async fn mark_processing(&mut self, ids: &[TaskId]) -> StoreResult<Vec<TaskId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<String> = ids.iter().map(|id| id.as_str().to_string()).collect();

        let rows = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET status = 'processing',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = ANY($1)
              AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(&raw)
        .fetch_all(self.pool()?)
        .await?;

        rows.iter()
            .map(|row| Ok(TaskId::from_string(row.try_get::<String, _>("id")?)))
            .collect()
    }

    async fn save_result(
        &mut self,
        id: &TaskId,
        result: &serde_json::Value,
        version: &str,
    ) -> StoreResult<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET status = 'completed',
                result = $2,
                analysis_version = $3,
                analyzed_at = NOW(),
                last_error = NULL,
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'processing'
            "#,
        )
        .bind(id.as_str())
        .bind(result)
        .bind(version)
        .execute(self.pool()?)
        .await?;

        Ok(outcome.rows_affected() == 1)
    }

    async fn record_failure(
        &mut self,
        id: &TaskId,
        error: &str,
        max_retries: u32,
    ) -> StoreResult<Option<FailureOutcome>> {
        let error = truncate_error(error);
        let mut tx = self.pool()?.begin().await?;

        let row = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET status = 'failed',
                last_error = $2,
                retry_count = retry_count + 1,
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND status = 'processing'
            RETURNING retry_count, path
            "#,
        )
        .bind(id.as_str())
        .bind(&error)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        let retry_count = to_u32(row.try_get("retry_count")?);
        let path: String = row.try_get("path")?;
        let metadata = FailureMetadata {
            file_path: path.clone(),
            retry_count,
            max_retries,
        };

        // The ledger count never falls behind the task's own counter, which
        // the stale sweep also advances.
        sqlx::query(
            r#"
            INSERT INTO enrichment_failures (
                entity_type, entity_id, entity_name, error_message,
                last_failed_at, retry_count, metadata, resolved, skipped
            ) VALUES ($1, $2, $3, $4, NOW(), $5, $6, FALSE, FALSE)
            ON CONFLICT (entity_type, entity_id) DO UPDATE SET
                error_message = EXCLUDED.error_message,
                last_failed_at = NOW(),
                retry_count = GREATEST(enrichment_failures.retry_count + 1, EXCLUDED.retry_count),
                metadata = EXCLUDED.metadata,
                resolved = FALSE,
                skipped = FALSE
            "#,
        )
        .bind(AUDIO_ENTITY_TYPE)
        .bind(id.as_str())
        .bind(entity_name(&path))
        .bind(&error)
        .bind(retry_count as i32)
        .bind(metadata.to_value())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(FailureOutcome::new(retry_count, max_retries)))
    }

    async fn reclaim_stale(&mut self, threshold: Duration, max_retries: u32) -> StoreResult<u64> {
        let outcome = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET status = 'pending',
                started_at = NULL,
                retry_count = retry_count + 1,
                updated_at = NOW()
            WHERE status = 'processing'
              AND COALESCE(started_at, updated_at) < NOW() - make_interval(secs => $1)
              AND retry_count < $2
            "#,
        )
        .bind(threshold.as_secs_f64())
        .bind(max_retries as i32)
        .execute(self.pool()?)
        .await?;

        Ok(outcome.rows_affected())
    }

    async fn retry_failed(&mut self, max_retries: u32) -> StoreResult<RetrySweep> {
        let mut tx = self.pool()?.begin().await?;

        let requeued = sqlx::query(
            r#"
            UPDATE analysis_tasks
            SET status = 'pending',
                last_error = NULL,
                updated_at = NOW()
            WHERE status = 'failed'
              AND retry_count < $1
            "#,
        )
        .bind(max_retries as i32)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let (permanently_failed,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM analysis_tasks
            WHERE status = 'failed'
              AND retry_count >= $1
            "#,
        )
        .bind(max_retries as i32)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RetrySweep {
            requeued,
            permanently_failed: permanently_failed.max(0) as u64,
        })
    }

    async fn worker_setting(&mut self) -> StoreResult<Option<i64>> {
        let row: Option<(Option<i32>,)> = sqlx::query_as(
            "SELECT analyzer_workers FROM system_settings WHERE id = 'default' LIMIT 1",
        )
        .fetch_optional(self.pool()?)
        .await?;

        Ok(row.and_then(|(workers,)| workers).map(i64::from))
    }

    async fn reconnect(&mut self) -> StoreResult<()> {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
        debug!("Reconnecting to PostgreSQL");
        let pool = Self::open_pool(&self.config).await?;
        self.pool = Some(pool);
        info!("Reconnected to PostgreSQL");
        Ok(())
    }

    async fn close(&mut self) {
        match self.pool.take() {
            Some(pool) => {
                pool.close().await;
                info!("Database connection closed");
            }
            None => warn!("Database connection already closed"),
        }
    }
}
