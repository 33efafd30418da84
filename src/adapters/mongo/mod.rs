//! MongoDB adapters.
//!
//! - [`MongoConfig`]: connection string and database, from a builder or the
//!   environment
//! - [`MongoDb`]: queries, updates, index management and duplicate-key
//!   upserts over one database
//! - record/BSON conversion helpers

mod client;
mod config;
mod convert;

pub use client::MongoDb;
pub use config::MongoConfig;
pub use convert::{bson_to_value, document_to_record, record_to_document, value_to_bson};
