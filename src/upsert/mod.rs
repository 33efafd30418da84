//! Duplicate-key upsert execution.
//!
//! [`UpsertExecutor`] performs a plain insert and, when a uniqueness
//! constraint rejects it, resolves the conflict per [`OnConflict`]: the
//! conflicting key is derived, then exactly one update or replace runs
//! against it. The executor never issues a write without a condition.
//!
//! Backends plug in through [`UpsertBackend`]; MySQL and MongoDB
//! implementations live in their adapters.

mod executor;
mod outcome;
mod policy;

pub use executor::{InsertError, UpsertBackend, UpsertExecutor};
pub use outcome::{BatchFailure, BatchOutcome, FailureReporting};
pub use policy::{OnConflict, UpdateColumns};
