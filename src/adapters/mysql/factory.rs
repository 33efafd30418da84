//! MySQL connection pool factory.

use sqlx::mysql::MySqlPoolOptions;

use super::{MySqlPool, MySqlPoolConfig};
use crate::errors::{Backend, StoreError};

/// Factory for creating MySQL connection pools from a [`MySqlPoolConfig`].
#[derive(Debug, Clone, Copy)]
pub struct MySqlPoolFactory;

impl MySqlPoolFactory {
    /// Creates a pool and establishes its first connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for an empty URL and
    /// [`StoreError::Connection`] if the database is unreachable.
    pub async fn create_pool(config: &MySqlPoolConfig) -> Result<MySqlPool, StoreError> {
        let options = Self::pool_options(config)?;
        let pool = options.connect(&config.url).await.map_err(|error| {
            tracing::error!("Failed to connect to MySQL ({:?}): {}", config, error);
            StoreError::connection(
                Backend::MySql,
                format!("failed to connect to MySQL: {error}"),
            )
        })?;
        tracing::info!("Connected to MySQL pool (max {})", config.max_connections);
        Ok(MySqlPool::new(pool))
    }

    /// Creates a pool that connects on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the URL is empty or does not
    /// parse.
    pub fn create_lazy_pool(config: &MySqlPoolConfig) -> Result<MySqlPool, StoreError> {
        let options = Self::pool_options(config)?;
        let pool = options.connect_lazy(&config.url).map_err(|error| {
            StoreError::configuration(format!("invalid MySQL URL: {error}"))
        })?;
        Ok(MySqlPool::new(pool))
    }

    fn pool_options(config: &MySqlPoolConfig) -> Result<MySqlPoolOptions, StoreError> {
        if config.url.is_empty() {
            return Err(StoreError::configuration("MySQL URL is empty"));
        }
        if config.min_connections > config.max_connections {
            return Err(StoreError::configuration(format!(
                "MySQL min_connections ({}) exceeds max_connections ({})",
                config.min_connections, config.max_connections
            )));
        }

        let mut options = MySqlPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout);

        if let Some(idle_timeout) = config.idle_timeout {
            options = options.idle_timeout(idle_timeout);
        }
        Ok(options)
    }
}
