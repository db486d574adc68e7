//! Redis integration tests.

use std::time::Duration;

use tonal_models::{ControlMessage, QueuedTask, WorkerCount};
use tonal_queue::{ControlChannel, QueueConfig, RedisControlChannel, RedisTaskQueue, TaskQueue};

fn test_config(suffix: &str) -> QueueConfig {
    dotenvy::dotenv().ok();
    let mut config = QueueConfig::from_env();
    config.queue_name = format!("tonal:test:queue:{}", suffix);
    config.control_channel = format!("tonal:test:control:{}", suffix);
    config
}

/// Test push-queue FIFO order and the empty-queue case.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_queue_fifo_cycle() {
    let config = test_config("fifo");
    let mut queue = RedisTaskQueue::new(config).expect("Failed to create queue");

    // Drain leftovers from earlier runs
    while !queue.pop_batch(100).await.expect("Failed to drain").is_empty() {}

    for i in 0..3 {
        queue
            .enqueue(&QueuedTask::new(format!("track-{}", i), format!("{}.flac", i)))
            .await
            .expect("Failed to enqueue");
    }
    assert_eq!(queue.len().await.expect("Failed to get length"), 3);

    let batch = queue.pop_batch(2).await.expect("Failed to pop");
    assert_eq!(batch.len(), 2);
    assert_eq!(batch[0].id.as_str(), "track-0");
    assert_eq!(batch[1].id.as_str(), "track-1");

    let rest = queue.pop_batch(10).await.expect("Failed to pop");
    assert_eq!(rest.len(), 1);
    assert!(queue.pop_batch(10).await.expect("Failed to pop").is_empty());
}

/// Test publish/subscribe of control commands.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_control_round_trip() {
    let config = test_config("control");
    let mut channel = RedisControlChannel::subscribe(&config)
        .await
        .expect("Failed to subscribe");

    assert_eq!(channel.poll(), None);

    RedisControlChannel::publish(&config, ControlMessage::Pause)
        .await
        .expect("Failed to publish");
    RedisControlChannel::publish(&config, ControlMessage::SetWorkers(WorkerCount::clamped(12)))
        .await
        .expect("Failed to publish");

    let mut received = Vec::new();
    for _ in 0..50 {
        if let Some(msg) = channel.poll() {
            received.push(msg);
            if received.len() == 2 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        received,
        vec![
            ControlMessage::Pause,
            ControlMessage::SetWorkers(WorkerCount::clamped(8))
        ]
    );

    channel.close();
    assert_eq!(channel.poll(), None);
}
