//! Error types shared by every adapter.
//!
//! # Error Categories
//!
//! - [`StoreError::Configuration`]: a connection parameter is missing or invalid
//! - [`StoreError::Validation`]: malformed statement input or upsert policy
//! - [`StoreError::ConflictResolution`]: a duplicate-key condition could not be derived
//! - [`StoreError::DuplicateKey`]: a uniqueness violation reported by a backend
//! - [`StoreError::Connection`]: a transient transport failure
//! - [`StoreError::ConnectionLost`]: liveness probe and bounded reconnect both failed
//! - [`StoreError::Backend`]: any other driver error
//! - [`StoreError::Serialization`]: JSON/BSON conversion failure
//! - [`StoreError::Timeout`]: operation timeout
//!
//! # Examples
//!
//! ```
//! use dbkit::errors::StoreError;
//!
//! let error = StoreError::validation("empty record");
//! assert!(error.is_validation());
//! ```

use thiserror::Error;

// =============================================================================
// Backend
// =============================================================================

/// External system an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Relational database (MySQL).
    MySql,
    /// Document database (MongoDB).
    MongoDb,
    /// Key-value store (Redis).
    Redis,
    /// Message broker (RabbitMQ).
    RabbitMq,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MySql => write!(formatter, "mysql"),
            Self::MongoDb => write!(formatter, "mongodb"),
            Self::Redis => write!(formatter, "redis"),
            Self::RabbitMq => write!(formatter, "rabbitmq"),
        }
    }
}

// =============================================================================
// StoreError
// =============================================================================

/// Error type for every operation in this crate.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// A required connection parameter is missing or unresolvable.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Detailed error message.
        message: String,
    },

    /// The caller supplied an invalid statement input or upsert policy.
    #[error("Validation error: {message}")]
    Validation {
        /// Detailed error message.
        message: String,
    },

    /// The conflicting key could not be derived from a duplicate-key error.
    #[error("Conflict resolution failed: {message}")]
    ConflictResolution {
        /// Detailed error message.
        message: String,
    },

    /// A uniqueness constraint rejected the write.
    #[error("Duplicate key in {target}: {message}")]
    DuplicateKey {
        /// The backend that rejected the write.
        target: Backend,
        /// The backend's error text, used to derive the conflict key.
        message: String,
    },

    /// A transport-level failure that a reconnect may fix.
    #[error("Connection to {target} failed: {message}")]
    Connection {
        /// The backend that failed.
        target: Backend,
        /// Detailed error message.
        message: String,
    },

    /// Reconnecting failed on every allowed attempt.
    #[error("Connection to {target} lost after {attempts} reconnect attempts")]
    ConnectionLost {
        /// The backend that could not be reached.
        target: Backend,
        /// Number of reconnect attempts made.
        attempts: u32,
    },

    /// Any other error reported by a driver.
    #[error("{target} error: {message}")]
    Backend {
        /// The backend that failed.
        target: Backend,
        /// Detailed error message.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Detailed error message.
        message: String,
    },

    /// An operation timed out.
    #[error("Operation timed out: {message}")]
    Timeout {
        /// Detailed error message.
        message: String,
    },
}

// =============================================================================
// Factory Methods
// =============================================================================

impl StoreError {
    /// Creates a new `Configuration` error.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbkit::errors::StoreError;
    ///
    /// let error = StoreError::configuration("MYSQL_IP is not set");
    /// assert!(error.is_configuration());
    /// ```
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new `Validation` error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new `ConflictResolution` error.
    #[must_use]
    pub fn conflict_resolution(message: impl Into<String>) -> Self {
        Self::ConflictResolution {
            message: message.into(),
        }
    }

    /// Creates a new `DuplicateKey` error.
    #[must_use]
    pub fn duplicate_key(target: Backend, message: impl Into<String>) -> Self {
        Self::DuplicateKey {
            target,
            message: message.into(),
        }
    }

    /// Creates a new `Connection` error.
    #[must_use]
    pub fn connection(target: Backend, message: impl Into<String>) -> Self {
        Self::Connection {
            target,
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionLost` error.
    #[must_use]
    pub const fn connection_lost(target: Backend, attempts: u32) -> Self {
        Self::ConnectionLost { target, attempts }
    }

    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(target: Backend, message: impl Into<String>) -> Self {
        Self::Backend {
            target,
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }
}

// =============================================================================
// Query Methods
// =============================================================================

impl StoreError {
    /// Returns `true` if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Returns `true` if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    /// Returns `true` if this is a conflict resolution error.
    #[must_use]
    pub const fn is_conflict_resolution(&self) -> bool {
        matches!(self, Self::ConflictResolution { .. })
    }

    /// Returns `true` if this is a duplicate key error.
    #[must_use]
    pub const fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }

    /// Returns `true` if this is a transient connection error.
    ///
    /// The reconnect logic treats these as a signal that the current handle is
    /// dead.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbkit::errors::{Backend, StoreError};
    ///
    /// assert!(StoreError::connection(Backend::Redis, "broken pipe").is_connection());
    /// assert!(!StoreError::connection_lost(Backend::Redis, 3).is_connection());
    /// ```
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }

    /// Returns `true` if reconnecting was exhausted.
    #[must_use]
    pub const fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// Returns `true` if this is a timeout error.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns the backend this error originated from, if any.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbkit::errors::{Backend, StoreError};
    ///
    /// let error = StoreError::backend(Backend::MongoDb, "bad command");
    /// assert_eq!(error.target(), Some(Backend::MongoDb));
    ///
    /// let error = StoreError::validation("empty record");
    /// assert_eq!(error.target(), None);
    /// ```
    #[must_use]
    pub const fn target(&self) -> Option<Backend> {
        match self {
            Self::DuplicateKey { target, .. }
            | Self::Connection { target, .. }
            | Self::ConnectionLost { target, .. }
            | Self::Backend { target, .. } => Some(*target),
            _ => None,
        }
    }
}

// =============================================================================
// From Implementations
// =============================================================================

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::PoolTimedOut => Self::Timeout {
                message: "mysql pool connection timed out".to_string(),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection {
                target: Backend::MySql,
                message: error.to_string(),
            },
            sqlx::Error::Configuration(_) => Self::Configuration {
                message: error.to_string(),
            },
            sqlx::Error::Database(database_error)
                if database_error.is_unique_violation()
                    || database_error.message().starts_with("Duplicate entry") =>
            {
                Self::DuplicateKey {
                    target: Backend::MySql,
                    message: database_error.message().to_string(),
                }
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => Self::Serialization {
                message: error.to_string(),
            },
            _ => Self::Backend {
                target: Backend::MySql,
                message: error.to_string(),
            },
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_timeout() {
            Self::Timeout {
                message: format!("redis operation timed out: {error}"),
            }
        } else if error.is_io_error()
            || error.is_connection_refusal()
            || error.is_connection_dropped()
        {
            Self::Connection {
                target: Backend::Redis,
                message: error.to_string(),
            }
        } else {
            Self::Backend {
                target: Backend::Redis,
                message: error.to_string(),
            }
        }
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(error: mongodb::error::Error) -> Self {
        use mongodb::error::{ErrorKind, WriteFailure};

        match error.kind.as_ref() {
            ErrorKind::Io(_) | ErrorKind::ServerSelection { .. } => Self::Connection {
                target: Backend::MongoDb,
                message: error.to_string(),
            },
            ErrorKind::Write(WriteFailure::WriteError(write_error))
                if write_error.code == crate::conflict::MONGO_DUPLICATE_KEY_CODE =>
            {
                Self::DuplicateKey {
                    target: Backend::MongoDb,
                    message: write_error.message.clone(),
                }
            }
            ErrorKind::BsonSerialization(_) | ErrorKind::BsonDeserialization(_) => {
                Self::Serialization {
                    message: error.to_string(),
                }
            }
            _ => Self::Backend {
                target: Backend::MongoDb,
                message: error.to_string(),
            },
        }
    }
}

impl From<lapin::Error> for StoreError {
    fn from(error: lapin::Error) -> Self {
        match &error {
            lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::InvalidChannelState(_)
            | lapin::Error::MissingHeartbeatError => Self::Connection {
                target: Backend::RabbitMq,
                message: error.to_string(),
            },
            _ => Self::Backend {
                target: Backend::RabbitMq,
                message: error.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization {
            message: format!("JSON: {error}"),
        }
    }
}

impl From<mongodb::bson::ser::Error> for StoreError {
    fn from(error: mongodb::bson::ser::Error) -> Self {
        Self::Serialization {
            message: format!("BSON: {error}"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
