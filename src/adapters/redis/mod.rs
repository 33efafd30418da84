//! Redis adapters.
//!
//! - [`RedisConfig`] / [`Topology`]: single node, sentinel or cluster
//! - [`RedisStore`]: set, list, key and pub/sub operations with bounded
//!   reconnect through a [`ConnectionSupervisor`]
//! - [`Subscription`]: handle to a background receive loop

mod config;
mod connection;
mod pubsub;
mod store;
mod supervisor;

pub use config::{RedisConfig, Topology};
pub use connection::{RedisConnector, StoreConnection};
pub use pubsub::{PubSubMessage, Subscription};
pub use store::{BatchAtomicity, KeyTtl, RedisStore, clamp_pop_count};
pub use supervisor::{ConnectionState, ConnectionSupervisor, Connector};
