//! Channel subscriptions running on their own task.

use futures::StreamExt;
use redis::aio::PubSub;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::RedisConnector;
use crate::errors::StoreError;

/// One message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

// =============================================================================
// Subscription
// =============================================================================

/// Handle to a running receive loop.
///
/// [`cancel`](Self::cancel) unsubscribes and waits for the loop to finish.
/// Dropping the handle stops the loop without waiting.
#[derive(Debug)]
pub struct Subscription {
    channels: Vec<String>,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    #[must_use]
    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    /// Returns `true` once the receive loop has stopped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Stops the receive loop and waits for it to unsubscribe.
    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            error!("Redis subscription task for {:?} failed: {}", self.channels, error);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// =============================================================================
// Receive Loop
// =============================================================================

/// Subscribes to `channels` and hands every message to `handler`, one at a
/// time, on a spawned task.
pub(crate) async fn subscribe<H>(
    connector: &RedisConnector,
    channels: &[&str],
    handler: H,
) -> Result<Subscription, StoreError>
where
    H: FnMut(PubSubMessage) + Send + 'static,
{
    if channels.is_empty() {
        return Err(StoreError::validation("No channels to subscribe to"));
    }

    let mut pubsub = connector.pubsub().await?;
    for channel in channels {
        pubsub.subscribe(*channel).await?;
    }
    let channels: Vec<String> = channels.iter().map(ToString::to_string).collect();
    info!("Subscribed to Redis channels {:?}", channels);

    let token = CancellationToken::new();
    let task = tokio::spawn(receive_loop(
        pubsub,
        channels.clone(),
        handler,
        token.clone(),
    ));

    Ok(Subscription {
        channels,
        token,
        task: Some(task),
    })
}

async fn receive_loop<H>(
    mut pubsub: PubSub,
    channels: Vec<String>,
    mut handler: H,
    token: CancellationToken,
) where
    H: FnMut(PubSubMessage) + Send + 'static,
{
    let mut stream_closed = false;
    {
        let messages = pubsub.on_message();
        tokio::pin!(messages);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                message = messages.next() => {
                    let Some(message) = message else {
                        warn!("Redis subscription to {:?} closed by the server", channels);
                        stream_closed = true;
                        break;
                    };
                    match message.get_payload::<String>() {
                        Ok(payload) => handler(PubSubMessage {
                            channel: message.get_channel_name().to_string(),
                            payload,
                        }),
                        Err(error) => warn!(
                            "Skipping undecodable message on {}: {}",
                            message.get_channel_name(),
                            error
                        ),
                    }
                }
            }
        }
    }

    if stream_closed {
        return;
    }
    for channel in &channels {
        if let Err(error) = pubsub.unsubscribe(channel.as_str()).await {
            debug!("Failed to unsubscribe from {}: {}", channel, error);
        }
    }
    info!("Unsubscribed from Redis channels {:?}", channels);
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn idle_subscription() -> Subscription {
        let token = CancellationToken::new();
        let child = token.clone();
        let task = tokio::spawn(async move { child.cancelled().await });
        Subscription {
            channels: vec!["news".to_string()],
            token,
            task: Some(task),
        }
    }

    #[tokio::test]
    async fn cancel_stops_and_joins_the_loop() {
        let subscription = idle_subscription();
        assert_eq!(subscription.channels(), ["news"]);
        assert!(!subscription.is_finished());

        tokio::time::timeout(Duration::from_secs(1), subscription.cancel())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn drop_cancels_the_loop() {
        let subscription = idle_subscription();
        let token = subscription.token.clone();

        drop(subscription);

        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn empty_channel_list_is_rejected() {
        let connector =
            RedisConnector::new(super::super::config::RedisConfig::single("127.0.0.1:1")).unwrap();
        let error = subscribe(&connector, &[], |_| {}).await.unwrap_err();
        assert!(error.is_validation());
    }
}
