//! RabbitMQ connection configuration.

use std::time::Duration;

use crate::config::{optional, optional_parsed, process_env, required};
use crate::errors::StoreError;
use crate::retry::RetryPolicy;

/// Configuration for a [`RabbitMq`](super::RabbitMq) client.
///
/// # Examples
///
/// ```
/// use dbkit::adapters::rabbitmq::RabbitMqConfig;
///
/// let config = RabbitMqConfig::new("mq.local", "app", "secret");
/// assert_eq!(config.port, 5672);
/// assert_eq!(config.vhost, "/");
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval negotiated with the broker, in seconds.
    pub heartbeat: u16,
    pub connection_timeout: Duration,
    pub reconnect: RetryPolicy,
}

impl RabbitMqConfig {
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 5672,
            user: user.into(),
            password: password.into(),
            vhost: "/".to_string(),
            heartbeat: 60,
            connection_timeout: Duration::from_secs(300),
            reconnect: RetryPolicy::new(3, Duration::from_secs(5)),
        }
    }

    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    #[must_use]
    pub const fn with_heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = seconds;
        self
    }

    #[must_use]
    pub const fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_reconnect(mut self, reconnect: RetryPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// AMQP URI including credentials, vhost, heartbeat and connection
    /// timeout (milliseconds).
    #[must_use]
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost),
            self.heartbeat,
            self.connection_timeout.as_millis()
        )
    }

    /// Loads configuration from environment variables (and `.env`).
    ///
    /// # Environment Variables
    ///
    /// - `RABBITMQ_IP`: broker host (required)
    /// - `RABBITMQ_PORT`: broker port (optional, default: 5672)
    /// - `RABBITMQ_USER`: user (required)
    /// - `RABBITMQ_PASS`: password (optional)
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if a required variable is missing
    /// or the port is not a number.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(process_env())
    }

    /// Loads configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// See [`RabbitMqConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let host = required(&lookup, "RABBITMQ_IP")?;
        let port: u16 = optional_parsed(&lookup, "RABBITMQ_PORT", 5672)?;
        let user = required(&lookup, "RABBITMQ_USER")?;
        let password = optional(&lookup, "RABBITMQ_PASS").unwrap_or_default();
        Ok(Self::new(host, user, password).with_port(port))
    }
}

impl std::fmt::Debug for RabbitMqConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RabbitMqConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("heartbeat", &self.heartbeat)
            .field("connection_timeout", &self.connection_timeout)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}
