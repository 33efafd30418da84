//! RabbitMQ connection, declarations, publishing and consumer startup.

use std::sync::atomic::{AtomicU64, Ordering};

use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::config::RabbitMqConfig;
use super::consumer::{BrokerMessage, ConsumeOptions, Consumption, spawn_consumer};
use crate::errors::{Backend, StoreError};

const CONSUMER_TAG_PREFIX: &str = "dbkit";

static CONSUMER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A consumer tag unique within the process, so one queue can be consumed
/// several times on the same channel.
fn consumer_tag(queue: &str) -> String {
    let sequence = CONSUMER_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{CONSUMER_TAG_PREFIX}-{queue}-{sequence}")
}

struct Link {
    connection: Connection,
    channel: Channel,
}

// =============================================================================
// RabbitMq
// =============================================================================

/// RabbitMQ client holding one connection and one confirming channel.
///
/// Every operation first checks both: a closed channel is reopened on the
/// live connection, a closed connection is replaced using the configured
/// retry policy.
pub struct RabbitMq {
    config: RabbitMqConfig,
    link: Mutex<Option<Link>>,
}

impl RabbitMq {
    /// Connects and opens a channel.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConnectionLost`] when every attempt failed.
    pub async fn connect(config: RabbitMqConfig) -> Result<Self, StoreError> {
        let link = open_link(&config).await?;
        Ok(Self {
            config,
            link: Mutex::new(Some(link)),
        })
    }

    /// Connects with [`RabbitMqConfig::from_env`].
    ///
    /// # Errors
    ///
    /// See [`RabbitMqConfig::from_env`] and [`RabbitMq::connect`].
    pub async fn from_env() -> Result<Self, StoreError> {
        Self::connect(RabbitMqConfig::from_env()?).await
    }

    #[must_use]
    pub const fn config(&self) -> &RabbitMqConfig {
        &self.config
    }

    /// Returns an open channel, reopening the channel or the whole
    /// connection as needed.
    async fn ensure_channel(&self) -> Result<Channel, StoreError> {
        let mut link = self.link.lock().await;

        match link.as_mut() {
            Some(current)
                if current.connection.status().connected()
                    && current.channel.status().connected() =>
            {
                return Ok(current.channel.clone());
            }
            Some(current) if current.connection.status().connected() => {
                warn!("RabbitMQ channel closed, opening a new one");
                match open_channel(&current.connection).await {
                    Ok(channel) => {
                        current.channel = channel.clone();
                        return Ok(channel);
                    }
                    Err(error) => error!("Failed to reopen RabbitMQ channel: {}", error),
                }
            }
            _ => warn!("RabbitMQ connection closed, reconnecting"),
        }

        let fresh = open_link(&self.config).await?;
        let channel = fresh.channel.clone();
        *link = Some(fresh);
        Ok(channel)
    }

    /// Declares an exchange.
    ///
    /// # Errors
    ///
    /// Returns the broker error, for instance when the exchange exists with
    /// another kind.
    pub async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> Result<(), StoreError> {
        let channel = self.ensure_channel().await?;
        declare_exchange_on(&channel, exchange, kind, durable).await
    }

    /// Declares `queue` (empty for a server-generated name) and binds it to
    /// `exchange`. Returns the queue name.
    ///
    /// # Errors
    ///
    /// Returns the broker error if declaration or binding fails.
    pub async fn declare_and_bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        exclusive: bool,
    ) -> Result<String, StoreError> {
        let channel = self.ensure_channel().await?;
        declare_and_bind_on(&channel, queue, exchange, routing_key, exclusive).await
    }

    /// Declares `exchange` (non-durable) and publishes `payload`, waiting
    /// for the broker's confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the broker rejects the message.
    pub async fn send_message(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        kind: ExchangeKind,
    ) -> Result<(), StoreError> {
        let channel = self.ensure_channel().await?;
        let result = async {
            declare_exchange_on(&channel, exchange, kind, false).await?;
            let confirmation = channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    payload,
                    BasicProperties::default(),
                )
                .await?
                .await?;
            if let Confirmation::Nack(_) = confirmation {
                return Err(StoreError::backend(
                    Backend::RabbitMq,
                    format!("message to exchange '{exchange}' was not confirmed"),
                ));
            }
            Ok::<(), StoreError>(())
        }
        .await;

        match &result {
            Ok(()) => info!(
                "Sent message to exchange '{}' with routing key '{}'",
                exchange, routing_key
            ),
            Err(error) => error!(
                "Failed to send message to exchange '{}': {}",
                exchange, error
            ),
        }
        result
    }

    /// Declares the exchange and queue of `options`, binds them and starts
    /// consuming on a spawned task that hands each message to `handler`.
    ///
    /// # Errors
    ///
    /// Returns the broker error if any declaration or the consume request
    /// fails.
    pub async fn receive_message<H>(
        &self,
        options: &ConsumeOptions,
        handler: H,
    ) -> Result<Consumption, StoreError>
    where
        H: FnMut(&BrokerMessage) -> Result<(), StoreError> + Send + 'static,
    {
        let channel = self.ensure_channel().await?;
        declare_exchange_on(&channel, &options.exchange, options.exchange_kind.clone(), false)
            .await?;
        let queue = declare_and_bind_on(
            &channel,
            &options.queue,
            &options.exchange,
            &options.routing_key,
            options.exclusive,
        )
        .await?;

        let consumer = channel
            .basic_consume(
                &queue,
                &consumer_tag(&queue),
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .inspect_err(|error| error!("Failed to consume queue {}: {}", queue, error))?;

        info!(
            "Consuming queue '{}' bound to exchange '{}'",
            queue, options.exchange
        );
        Ok(spawn_consumer(
            channel,
            consumer,
            queue,
            options.auto_ack,
            handler,
        ))
    }

    /// Closes the connection if it is open.
    pub async fn close(&self) {
        let Some(link) = self.link.lock().await.take() else {
            return;
        };
        if !link.connection.status().connected() {
            return;
        }
        match link.connection.close(200, "closing").await {
            Ok(()) => info!("RabbitMQ connection closed"),
            Err(error) => warn!("Failed to close RabbitMQ connection: {}", error),
        }
    }
}

impl std::fmt::Debug for RabbitMq {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RabbitMq")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Connection Helpers
// =============================================================================

async fn open_link(config: &RabbitMqConfig) -> Result<Link, StoreError> {
    let attempts = config.reconnect.max_attempts();
    let uri = config.uri();

    for attempt in 1..=attempts {
        let opened = async {
            let connection = Connection::connect(&uri, ConnectionProperties::default()).await?;
            let channel = open_channel(&connection).await?;
            Ok::<_, StoreError>(Link {
                connection,
                channel,
            })
        }
        .await;

        match opened {
            Ok(link) => {
                info!(
                    "Connected to RabbitMQ at {}:{} (attempt {}/{})",
                    config.host, config.port, attempt, attempts
                );
                return Ok(link);
            }
            Err(error) => {
                warn!(
                    "Failed to connect to RabbitMQ at {}:{} as {} (attempt {}/{}): {}",
                    config.host, config.port, config.user, attempt, attempts, error
                );
                if attempt < attempts {
                    tokio::time::sleep(config.reconnect.delay()).await;
                }
            }
        }
    }

    error!("Giving up on RabbitMQ after {} attempts", attempts);
    Err(StoreError::connection_lost(Backend::RabbitMq, attempts))
}

async fn open_channel(connection: &Connection) -> Result<Channel, StoreError> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    Ok(channel)
}

/// The default exchange (`""`) always exists and cannot be declared.
async fn declare_exchange_on(
    channel: &Channel,
    exchange: &str,
    kind: ExchangeKind,
    durable: bool,
) -> Result<(), StoreError> {
    if exchange.is_empty() {
        return Ok(());
    }
    channel
        .exchange_declare(
            exchange,
            kind,
            ExchangeDeclareOptions {
                durable,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .inspect_err(|error| error!("Failed to declare exchange {}: {}", exchange, error))?;
    Ok(())
}

async fn declare_and_bind_on(
    channel: &Channel,
    queue: &str,
    exchange: &str,
    routing_key: &str,
    exclusive: bool,
) -> Result<String, StoreError> {
    let declared = channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                exclusive,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .inspect_err(|error| error!("Failed to declare queue '{}': {}", queue, error))?;
    let name = declared.name().as_str().to_string();

    if !exchange.is_empty() {
        channel
            .queue_bind(
                &name,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .inspect_err(|error| {
                error!("Failed to bind queue {} to {}: {}", name, exchange, error);
            })?;
    }
    Ok(name)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn consumer_tags_differ_for_the_same_queue() {
        let first = consumer_tag("jobs");
        let second = consumer_tag("jobs");
        assert_ne!(first, second);
        assert!(first.starts_with("dbkit-jobs-"));
    }

    #[tokio::test]
    async fn unreachable_broker_is_connection_lost_after_policy() {
        let config = RabbitMqConfig::new("127.0.0.1", "guest", "guest")
            .with_port(1)
            .with_connection_timeout(Duration::from_secs(2))
            .with_reconnect(RetryPolicy::new(2, Duration::from_millis(10)));

        let error = RabbitMq::connect(config).await.unwrap_err();

        assert!(matches!(
            error,
            StoreError::ConnectionLost {
                target: Backend::RabbitMq,
                attempts: 2
            }
        ));
    }
}
