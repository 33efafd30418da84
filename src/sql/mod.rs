//! MySQL statement builder.
//!
//! Pure functions that turn a table name, a [`Record`](crate::record::Record)
//! and conflict options into statement text. Identifiers are delimited and
//! values rendered as escaped literals; the output is an already-escaped
//! statement and must not have untrusted input interpolated into it.

mod builder;
mod literal;
mod options;

pub use builder::{
    BatchStatement, build_batch_insert, build_conditional_update, build_insert,
    build_where_condition,
};
pub use literal::{escape_text, quote_identifier, quote_table, render_literal};
pub use options::{InsertMode, InsertOptions};
