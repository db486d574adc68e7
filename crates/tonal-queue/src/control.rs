//! Control topic via Redis Pub/Sub.

use std::time::Duration;

use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tonal_models::ControlMessage;

use crate::error::{QueueError, QueueResult};
use crate::queue::QueueConfig;

/// Delay before re-subscribing after the subscription connection drops.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Non-blocking inlet for runtime control commands.
pub trait ControlChannel: Send {
    /// Take the next pending command, if any. Never waits.
    fn poll(&mut self) -> Option<ControlMessage>;

    /// Release the subscription. Later polls return `None`.
    fn close(&mut self);
}

/// Subscriber on the Redis control topic.
///
/// A background task owns the pub/sub connection and forwards decoded
/// commands into a local channel, so `poll` is a plain `try_recv`. If the
/// connection drops the task keeps re-subscribing; commands published in
/// the gap are lost, which leaves task processing unaffected.
pub struct RedisControlChannel {
    rx: mpsc::UnboundedReceiver<ControlMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl RedisControlChannel {
    /// Subscribe to the configured control topic.
    ///
    /// The first subscription is made eagerly so configuration errors
    /// surface to the caller.
    pub async fn subscribe(config: &QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        let channel = config.control_channel.clone();

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| QueueError::subscribe_failed(e.to_string()))?;
        pubsub.subscribe(&channel).await?;
        info!("Subscribed to control channel: {}", channel);

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            let mut pubsub = Some(pubsub);
            loop {
                let current = match pubsub.take() {
                    Some(p) => p,
                    None => match resubscribe(&client, &channel).await {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("Control channel re-subscribe failed: {}", e);
                            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                            continue;
                        }
                    },
                };

                let mut messages = current.into_on_message();
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            debug!("Unreadable control payload: {}", e);
                            continue;
                        }
                    };
                    info!("Received control signal: {}", payload);
                    if tx.send(ControlMessage::parse(&payload)).is_err() {
                        return;
                    }
                }

                warn!("Control channel subscription ended, re-subscribing");
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });

        Ok(Self {
            rx,
            forwarder: Some(forwarder),
        })
    }

    /// Publish a command on the control topic.
    pub async fn publish(config: &QueueConfig, message: ControlMessage) -> QueueResult<()> {
        let Some(payload) = message.to_payload() else {
            return Ok(());
        };
        let client = redis::Client::open(config.redis_url.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        conn.publish::<_, _, ()>(&config.control_channel, payload).await?;
        Ok(())
    }
}

async fn resubscribe(client: &redis::Client, channel: &str) -> QueueResult<redis::aio::PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    info!("Re-subscribed to control channel: {}", channel);
    Ok(pubsub)
}

impl ControlChannel for RedisControlChannel {
    fn poll(&mut self) -> Option<ControlMessage> {
        self.rx.try_recv().ok()
    }

    fn close(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            self.rx.close();
            info!("Control channel closed");
        }
    }
}

/// A missing subscription never yields commands.
impl<C: ControlChannel> ControlChannel for Option<C> {
    fn poll(&mut self) -> Option<ControlMessage> {
        self.as_mut().and_then(|c| c.poll())
    }

    fn close(&mut self) {
        if let Some(c) = self.as_mut() {
            c.close();
        }
    }
}

impl Drop for RedisControlChannel {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
