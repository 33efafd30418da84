//! Backend adapters.
//!
//! Each adapter owns its configuration, connection handling and operations.
//! The relational and document adapters also implement
//! [`UpsertBackend`](crate::upsert::UpsertBackend).

pub mod mongo;
pub mod mysql;
pub mod rabbitmq;
pub mod redis;
