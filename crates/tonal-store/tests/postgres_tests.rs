//! PostgreSQL integration tests.

use std::time::Duration;

use tonal_models::TaskId;
use tonal_store::{PgTaskStore, StoreConfig, TaskStore};

async fn connect() -> PgTaskStore {
    dotenvy::dotenv().ok();
    let config = StoreConfig::from_env().expect("DATABASE_URL must be set");
    let store = PgTaskStore::connect(config.clone())
        .await
        .expect("Failed to connect");
    store.run_migrations().await.expect("Failed to migrate");
    store
}

async fn insert_task(database_url: &str, id: &str, status: &str, retry_count: i32, age_minutes: i32) {
    let pool = sqlx::PgPool::connect(database_url).await.expect("Failed to connect");
    sqlx::query(
        r#"
        INSERT INTO analysis_tasks (id, path, status, retry_count, started_at, updated_at)
        VALUES ($1, $2, $3, $4,
                NOW() - make_interval(mins => $5),
                NOW() - make_interval(mins => $5))
        "#,
    )
    .bind(id)
    .bind(format!("{}.flac", id))
    .bind(status)
    .bind(retry_count)
    .bind(age_minutes)
    .execute(&pool)
    .await
    .expect("Failed to insert task");
    pool.close().await;
}

fn unique_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

/// Test the claim, fail, retry and complete cycle against a real database.
#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_task_lifecycle() {
    let mut store = connect().await;
    let url = StoreConfig::from_env().unwrap().database_url;
    let id = unique_id("lifecycle");
    insert_task(&url, &id, "pending", 0, 0).await;
    let task_id = TaskId::from(id.as_str());

    let claimed = store.mark_processing(&[task_id.clone()]).await.expect("claim");
    assert_eq!(claimed, vec![task_id.clone()]);
    assert!(store.mark_processing(&[task_id.clone()]).await.expect("claim").is_empty());

    let outcome = store
        .record_failure(&task_id, "decoder exploded", 3)
        .await
        .expect("record failure")
        .expect("task was processing");
    assert_eq!(outcome.retry_count, 1);
    assert!(!outcome.permanent);

    let sweep = store.retry_failed(3).await.expect("retry sweep");
    assert!(sweep.requeued >= 1);

    store.mark_processing(&[task_id.clone()]).await.expect("claim");
    let saved = store
        .save_result(&task_id, &serde_json::json!({"bpm": 128.0}), "test-v1")
        .await
        .expect("save");
    assert!(saved);

    store.close().await;
}

/// Test the stale-processing sweep.
#[tokio::test]
#[ignore = "requires Postgres"]
async fn test_reclaim_stale() {
    let mut store = connect().await;
    let url = StoreConfig::from_env().unwrap().database_url;
    let stale = unique_id("stale");
    let fresh = unique_id("fresh");
    insert_task(&url, &stale, "processing", 0, 15).await;
    insert_task(&url, &fresh, "processing", 0, 1).await;

    let reclaimed = store
        .reclaim_stale(Duration::from_secs(600), 3)
        .await
        .expect("reclaim");
    assert!(reclaimed >= 1);

    // The fresh task is still claimed and cannot be claimed again
    let claimed = store
        .mark_processing(&[TaskId::from(fresh.as_str()), TaskId::from(stale.as_str())])
        .await
        .expect("claim");
    assert_eq!(claimed, vec![TaskId::from(stale.as_str())]);

    store.close().await;
}
