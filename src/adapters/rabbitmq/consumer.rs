//! Background consumption of one queue.

use std::borrow::Cow;

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicCancelOptions, BasicNackOptions};
use lapin::{Channel, Consumer, ExchangeKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::StoreError;

// =============================================================================
// ConsumeOptions
// =============================================================================

/// What [`RabbitMq::receive_message`](super::RabbitMq::receive_message)
/// declares and consumes.
///
/// Defaults: fanout exchange `""`, server-named exclusive queue, automatic
/// acknowledgement.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub routing_key: String,
    /// Empty for a server-generated name.
    pub queue: String,
    pub exclusive: bool,
    /// When `false`, each message is acknowledged after the handler returns
    /// `Ok` and requeued when it returns `Err`.
    pub auto_ack: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            exchange: String::new(),
            exchange_kind: ExchangeKind::Fanout,
            routing_key: String::new(),
            queue: String::new(),
            exclusive: true,
            auto_ack: true,
        }
    }
}

impl ConsumeOptions {
    #[must_use]
    pub fn new(exchange: impl Into<String>, exchange_kind: ExchangeKind) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    #[must_use]
    pub const fn with_exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    #[must_use]
    pub const fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }
}

// =============================================================================
// BrokerMessage
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

impl BrokerMessage {
    /// Payload as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

// =============================================================================
// Consumption
// =============================================================================

/// Handle to a running consumer.
///
/// [`cancel`](Self::cancel) cancels the consumer on the broker and waits for
/// the task. Dropping the handle stops the task without waiting.
#[derive(Debug)]
pub struct Consumption {
    queue: String,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Consumption {
    /// Name of the consumed queue, as declared by the broker.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub async fn cancel(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take()
            && let Err(error) = task.await
        {
            error!("RabbitMQ consumer task for {} failed: {}", self.queue, error);
        }
    }
}

impl Drop for Consumption {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

pub(crate) fn spawn_consumer<H>(
    channel: Channel,
    consumer: Consumer,
    queue: String,
    auto_ack: bool,
    handler: H,
) -> Consumption
where
    H: FnMut(&BrokerMessage) -> Result<(), StoreError> + Send + 'static,
{
    let token = CancellationToken::new();
    let task = tokio::spawn(consume_loop(
        channel,
        consumer,
        queue.clone(),
        auto_ack,
        handler,
        token.clone(),
    ));
    Consumption {
        queue,
        token,
        task: Some(task),
    }
}

async fn consume_loop<H>(
    channel: Channel,
    consumer: Consumer,
    queue: String,
    auto_ack: bool,
    mut handler: H,
    token: CancellationToken,
) where
    H: FnMut(&BrokerMessage) -> Result<(), StoreError> + Send + 'static,
{
    let consumer_tag = consumer.tag().as_str().to_string();
    tokio::pin!(consumer);
    info!("Waiting for messages on queue {}", queue);

    loop {
        let delivery = tokio::select! {
            () = token.cancelled() => break,
            delivery = consumer.next() => delivery,
        };
        let delivery = match delivery {
            Some(Ok(delivery)) => delivery,
            Some(Err(error)) => {
                error!("Failed to receive from queue {}: {}", queue, error);
                break;
            }
            None => {
                warn!("Consumer on queue {} closed by the broker", queue);
                return;
            }
        };

        let message = BrokerMessage {
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            payload: delivery.data.clone(),
            redelivered: delivery.redelivered,
        };
        let outcome = handler(&message);
        if auto_ack {
            if let Err(error) = outcome {
                warn!("Handler failed for message on {}: {}", queue, error);
            }
            continue;
        }

        let settled = match outcome {
            Ok(()) => delivery.ack(BasicAckOptions::default()).await,
            Err(error) => {
                warn!("Handler failed for message on {}, requeueing: {}", queue, error);
                delivery
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    })
                    .await
            }
        };
        if let Err(error) = settled {
            error!("Failed to acknowledge message on {}: {}", queue, error);
        }
    }

    if let Err(error) = channel
        .basic_cancel(&consumer_tag, BasicCancelOptions::default())
        .await
    {
        warn!("Failed to cancel consumer {}: {}", consumer_tag, error);
    }
    info!("Stopped consuming queue {}", queue);
}

// =============================================================================
// Tests
// =============================================================================
