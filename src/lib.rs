//! # dbkit
//!
//! Connection, upsert and batch helpers for MySQL, MongoDB, Redis and
//! RabbitMQ.
//!
//! ## Overview
//!
//! - **Records**: ordered column/value maps ([`record::Record`]) with a
//!   deterministic coercion to SQL scalars
//! - **SQL builder**: insert, batch insert and conditional update statements
//!   for MySQL ([`sql`])
//! - **Upserts**: insert first, resolve duplicate keys afterwards with a
//!   fail/ignore/replace/update policy ([`upsert`], [`conflict`])
//! - **Adapters**: MySQL and MongoDB clients implementing the upsert
//!   backend, a reconnecting Redis store and a RabbitMQ client ([`adapters`])
//!
//! ## Example
//!
//! ```rust
//! use dbkit::record;
//! use dbkit::sql::{InsertOptions, build_insert};
//!
//! let row = record! { "id" => 1, "name" => "a" };
//! let sql = build_insert(
//!     "users",
//!     &row,
//!     &InsertOptions::new().update_columns(["name"]),
//! )
//! .unwrap();
//!
//! assert_eq!(
//!     sql,
//!     "insert into `users` (`id`, `name`) values (1, 'a') on duplicate key update `name`=values(`name`)"
//! );
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod adapters;
pub mod config;
pub mod conflict;
pub mod errors;
pub mod logging;
pub mod record;
pub mod retry;
pub mod sql;
pub mod upsert;

pub use errors::{Backend, StoreError};
pub use record::{Record, Value};
