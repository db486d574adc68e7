//! Schema migrations.
//!
//! Each statement is applied once and recorded in `_migrations`; all
//! statements use `IF NOT EXISTS` so a partially applied run can be
//! repeated safely.

use sqlx::PgPool;
use tracing::info;

use crate::error::{StoreError, StoreResult};

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analysis_tasks (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
        retry_count INTEGER NOT NULL DEFAULT 0,
        started_at TIMESTAMPTZ,
        last_error TEXT,
        result JSONB,
        analyzed_at TIMESTAMPTZ,
        analysis_version TEXT,
        file_modified TIMESTAMPTZ,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_analysis_tasks_status
        ON analysis_tasks (status, file_modified DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS enrichment_failures (
        id BIGSERIAL PRIMARY KEY,
        entity_type TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        entity_name TEXT,
        error_message TEXT NOT NULL,
        last_failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        retry_count INTEGER NOT NULL DEFAULT 1,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        resolved BOOLEAN NOT NULL DEFAULT FALSE,
        skipped BOOLEAN NOT NULL DEFAULT FALSE,
        UNIQUE (entity_type, entity_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS system_settings (
        id TEXT PRIMARY KEY,
        analyzer_workers INTEGER
    )
    "#,
];

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.ensure_migrations_table().await?;

        for (idx, statement) in SCHEMA_STATEMENTS.iter().enumerate() {
            let name = format!("tonal_schema_v1_part_{}", idx);
            if !self.is_applied(&name).await? {
                self.apply(&name, statement).await?;
                info!("Applied migration {}", name);
            }
        }

        Ok(())
    }

    async fn ensure_migrations_table(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_applied(&self, name: &str) -> StoreResult<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn apply(&self, name: &str, sql: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }
}
