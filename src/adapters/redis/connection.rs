//! Topology-aware connections and the connector the supervisor drives.

use std::future::Future;
use std::sync::Arc;

use redis::aio::{ConnectionLike, MultiplexedConnection, PubSub};
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::sentinel::{Sentinel, SentinelNodeConnectionInfo};
use redis::{Cmd, Pipeline, RedisConnectionInfo, RedisFuture};

use super::config::{RedisConfig, Topology};
use super::supervisor::Connector;
use crate::errors::{Backend, StoreError};

// =============================================================================
// StoreConnection
// =============================================================================

/// Connection to a single node (standalone or sentinel master) or to a
/// cluster. Both are multiplexed, so clones share one socket set.
#[derive(Clone)]
pub enum StoreConnection {
    Node(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl StoreConnection {
    #[must_use]
    pub const fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster(_))
    }
}

impl ConnectionLike for StoreConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, redis::Value> {
        match self {
            Self::Node(connection) => connection.req_packed_command(cmd),
            Self::Cluster(connection) => connection.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<redis::Value>> {
        match self {
            Self::Node(connection) => connection.req_packed_commands(cmd, offset, count),
            Self::Cluster(connection) => connection.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Node(connection) => connection.get_db(),
            Self::Cluster(connection) => connection.get_db(),
        }
    }
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(_) => formatter.write_str("StoreConnection::Node"),
            Self::Cluster(_) => formatter.write_str("StoreConnection::Cluster"),
        }
    }
}

// =============================================================================
// RedisConnector
// =============================================================================

/// Opens connections for the configured [`Topology`].
#[derive(Debug, Clone)]
pub struct RedisConnector {
    config: Arc<RedisConfig>,
}

impl RedisConnector {
    /// Creates a connector after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the topology is invalid.
    pub fn new(config: RedisConfig) -> Result<Self, StoreError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
        })
    }

    #[must_use]
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    /// Opens a dedicated pub/sub connection.
    ///
    /// Cluster nodes forward every `PUBLISH`, so subscribing through the
    /// first seed node receives messages published anywhere in the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the node cannot be reached in
    /// time.
    pub async fn pubsub(&self) -> Result<PubSub, StoreError> {
        self.bounded(async {
            let client = self.node_client().await?;
            client.get_async_pubsub().await.map_err(StoreError::from)
        })
        .await
    }

    /// Client for the node that serves commands: the standalone server, the
    /// current sentinel master, or the first cluster seed.
    async fn node_client(&self) -> Result<redis::Client, StoreError> {
        match &self.config.topology {
            Topology::Single { node } => Ok(redis::Client::open(self.config.node_url(node)?)?),
            Topology::Cluster { nodes } => {
                let node = nodes.first().ok_or_else(|| {
                    StoreError::configuration("Redis topology has no nodes")
                })?;
                Ok(redis::Client::open(self.config.node_url(node)?)?)
            }
            Topology::Sentinel {
                nodes,
                service_name,
            } => {
                let sentinel_urls = nodes
                    .iter()
                    .map(|node| sentinel_url(node))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut sentinel = Sentinel::build(sentinel_urls)?;

                let mut redis_info = RedisConnectionInfo::default();
                redis_info.db = self.config.db;
                redis_info.password.clone_from(&self.config.password);
                let mut node_info = SentinelNodeConnectionInfo::default();
                node_info.redis_connection_info = Some(redis_info);

                Ok(sentinel
                    .async_master_for(service_name, Some(&node_info))
                    .await?)
            }
        }
    }

    async fn open(&self) -> Result<StoreConnection, StoreError> {
        if let Topology::Cluster { nodes } = &self.config.topology {
            let urls = nodes
                .iter()
                .map(|node| self.config.node_url(node))
                .collect::<Result<Vec<_>, _>>()?;
            let mut builder = ClusterClient::builder(urls);
            if let Some(password) = &self.config.password {
                builder = builder.password(password.clone());
            }
            let connection = builder.build()?.get_async_connection().await?;
            return Ok(StoreConnection::Cluster(connection));
        }

        let client = self.node_client().await?;
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(StoreConnection::Node(connection))
    }

    async fn bounded<T>(
        &self,
        future: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.config.connection_timeout, future)
            .await
            .map_err(|_| {
                StoreError::connection(
                    Backend::Redis,
                    format!(
                        "no answer within {:?} from {}",
                        self.config.connection_timeout,
                        self.config.topology.nodes().join(",")
                    ),
                )
            })?
    }
}

impl Connector for RedisConnector {
    type Connection = StoreConnection;

    fn target(&self) -> Backend {
        Backend::Redis
    }

    async fn connect(&self) -> Result<StoreConnection, StoreError> {
        self.bounded(self.open()).await
    }

    async fn probe(&self, connection: &StoreConnection) -> Result<(), StoreError> {
        let mut connection = connection.clone();
        self.bounded(async move {
            redis::cmd("PING")
                .query_async::<String>(&mut connection)
                .await
                .map(|_| ())
                .map_err(StoreError::from)
        })
        .await
    }
}

/// Sentinels are addressed without the data password or database.
fn sentinel_url(node: &str) -> Result<String, StoreError> {
    let (host, port) = super::config::parse_node(node)?;
    Ok(format!("redis://{host}:{port}"))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    mod constructor_tests {
        use super::*;

        #[rstest]
        fn rejects_invalid_topology() {
            let error = RedisConnector::new(RedisConfig::cluster(Vec::new())).unwrap_err();
            assert!(error.is_configuration());
        }

        #[rstest]
        fn keeps_config() {
            let connector = RedisConnector::new(RedisConfig::single("h:6379").with_db(5)).unwrap();
            assert_eq!(connector.config().db, 5);
            assert_eq!(connector.target(), Backend::Redis);
        }
    }

    mod clone_tests {
        use super::*;

        #[rstest]
        fn connector_is_clone() {
            fn assert_clone<T: Clone>() {}
            assert_clone::<RedisConnector>();
            assert_clone::<StoreConnection>();
        }
    }

    mod url_tests {
        use super::*;

        #[rstest]
        fn sentinel_url_omits_credentials() {
            assert_eq!(sentinel_url("s1:26379").unwrap(), "redis://s1:26379");
        }
    }

    mod timeout_tests {
        use super::*;
        use std::time::Duration;

        #[tokio::test(start_paused = true)]
        async fn bounded_turns_elapsed_into_connection_error() {
            let connector = RedisConnector::new(
                RedisConfig::single("h:6379").with_connection_timeout(Duration::from_secs(1)),
            )
            .unwrap();

            let error = connector
                .bounded(std::future::pending::<Result<(), StoreError>>())
                .await
                .unwrap_err();

            assert!(error.is_connection());
        }
    }
}
