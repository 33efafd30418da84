//! Redis connection configuration.
//!
//! The deployment topology is explicit ([`Topology`]); only
//! [`RedisConfig::from_env`] infers it from the shape of the node list.

use std::time::Duration;

use crate::config::{optional, optional_parsed, process_env, required};
use crate::errors::StoreError;
use crate::retry::RetryPolicy;

const DEFAULT_PORT: u16 = 6379;

// =============================================================================
// Topology
// =============================================================================

/// How the Redis deployment is reached. Nodes are `host:port` strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topology {
    /// One standalone server.
    Single { node: String },
    /// Sentinels that resolve the current master of `service_name`.
    Sentinel {
        nodes: Vec<String>,
        service_name: String,
    },
    /// Cluster seed nodes.
    Cluster { nodes: Vec<String> },
}

impl Topology {
    /// Returns every configured node.
    #[must_use]
    pub fn nodes(&self) -> Vec<&str> {
        match self {
            Self::Single { node } => vec![node.as_str()],
            Self::Sentinel { nodes, .. } | Self::Cluster { nodes } => {
                nodes.iter().map(String::as_str).collect()
            }
        }
    }

    #[must_use]
    pub const fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster { .. })
    }
}

// =============================================================================
// RedisConfig
// =============================================================================

/// Configuration for a Redis client.
///
/// # Examples
///
/// ```
/// use dbkit::adapters::redis::{RedisConfig, Topology};
///
/// let config = RedisConfig::single("127.0.0.1:6379").with_db(2);
/// assert!(matches!(config.topology, Topology::Single { .. }));
/// assert_eq!(config.db, 2);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct RedisConfig {
    pub topology: Topology,
    pub password: Option<String>,
    /// Logical database. Ignored by clusters, which only serve database 0.
    pub db: i64,
    /// Upper bound for establishing one connection.
    pub connection_timeout: Duration,
    /// Attempts and delay of the reconnect loop.
    pub reconnect: RetryPolicy,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::single(format!("127.0.0.1:{DEFAULT_PORT}"))
    }
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RedisConfig")
            .field("topology", &self.topology)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("db", &self.db)
            .field("connection_timeout", &self.connection_timeout)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl RedisConfig {
    #[must_use]
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            password: None,
            db: 0,
            connection_timeout: Duration::from_secs(5),
            reconnect: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub fn single(node: impl Into<String>) -> Self {
        Self::new(Topology::Single { node: node.into() })
    }

    #[must_use]
    pub fn sentinel(nodes: Vec<String>, service_name: impl Into<String>) -> Self {
        Self::new(Topology::Sentinel {
            nodes,
            service_name: service_name.into(),
        })
    }

    #[must_use]
    pub fn cluster(nodes: Vec<String>) -> Self {
        Self::new(Topology::Cluster { nodes })
    }

    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub const fn with_db(mut self, db: i64) -> Self {
        self.db = db;
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

    /// Checks that every node parses and the topology is complete.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for an empty node list, a blank
    /// sentinel service name or a node with an invalid port.
    pub fn validate(&self) -> Result<(), StoreError> {
        let nodes = self.topology.nodes();
        if nodes.is_empty() {
            return Err(StoreError::configuration("Redis topology has no nodes"));
        }
        for node in nodes {
            parse_node(node)?;
        }
        if let Topology::Sentinel { service_name, .. } = &self.topology
            && service_name.trim().is_empty()
        {
            return Err(StoreError::configuration(
                "Redis sentinel topology needs a service name",
            ));
        }
        Ok(())
    }

    /// Returns the `redis://` URL of `node`, carrying password and database.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the node does not parse.
    pub fn node_url(&self, node: &str) -> Result<String, StoreError> {
        let (host, port) = parse_node(node)?;
        let credentials = self
            .password
            .as_ref()
            .map(|password| format!(":{}@", urlencoding::encode(password)))
            .unwrap_or_default();
        let db = if self.topology.is_cluster() { 0 } else { self.db };
        Ok(format!("redis://{credentials}{host}:{port}/{db}"))
    }

    /// Loads configuration from environment variables (and `.env`).
    ///
    /// # Environment Variables
    ///
    /// - `REDISDB_IP_PORTS`: comma separated `host:port` list (required)
    /// - `REDISDB_DB`: logical database (optional, default: 0)
    /// - `REDISDB_USER_PASS`: password (optional)
    /// - `REDISDB_SERVICE_NAME`: sentinel service name (optional)
    ///
    /// One node gives [`Topology::Single`] (a service name is ignored),
    /// several nodes with a service name give [`Topology::Sentinel`], several
    /// nodes without one give [`Topology::Cluster`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the node list is missing or
    /// invalid, or the database is not a number.
    pub fn from_env() -> Result<Self, StoreError> {
        Self::from_lookup(process_env())
    }

    /// Loads configuration through `lookup` instead of the process environment.
    ///
    /// # Errors
    ///
    /// See [`RedisConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, StoreError> {
        let nodes: Vec<String> = required(&lookup, "REDISDB_IP_PORTS")?
            .split(',')
            .map(str::trim)
            .filter(|node| !node.is_empty())
            .map(String::from)
            .collect();
        let db: i64 = optional_parsed(&lookup, "REDISDB_DB", 0)?;
        let password = optional(&lookup, "REDISDB_USER_PASS");
        let service_name = optional(&lookup, "REDISDB_SERVICE_NAME");

        let topology = match (nodes.as_slice(), service_name) {
            ([], _) => {
                return Err(StoreError::configuration(
                    "REDISDB_IP_PORTS contains no nodes",
                ));
            }
            ([node], _) => Topology::Single { node: node.clone() },
            (_, Some(service_name)) => Topology::Sentinel {
                nodes,
                service_name,
            },
            (_, None) => Topology::Cluster { nodes },
        };

        let config = Self {
            password,
            db,
            ..Self::new(topology)
        };
        config.validate()?;
        Ok(config)
    }
}

/// Splits `host:port`, defaulting the port to 6379.
pub(crate) fn parse_node(node: &str) -> Result<(&str, u16), StoreError> {
    let node = node.trim();
    let (host, port) = match node.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse::<u16>().map_err(|_| {
                StoreError::configuration(format!("Invalid port in Redis node '{node}'"))
            })?;
            (host, port)
        }
        None => (node, DEFAULT_PORT),
    };
    if host.is_empty() {
        return Err(StoreError::configuration(format!(
            "Missing host in Redis node '{node}'"
        )));
    }
    Ok((host, port))
}

// =============================================================================
// Tests
// =============================================================================
