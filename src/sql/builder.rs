//! Statement rendering.

use indexmap::IndexSet;

use super::literal::{quote_identifier, quote_table, render_literal};
use super::options::{InsertMode, InsertOptions};
use crate::errors::StoreError;
use crate::record::{Record, SqlValue, Value};

/// A single-row parameterized statement and the rows to bind to it.
pub type BatchStatement = (String, Vec<Vec<SqlValue>>);

// =============================================================================
// Single Row
// =============================================================================

/// Renders a single-row insert with literal values.
///
/// # Errors
///
/// Returns [`StoreError::Validation`] when the record is empty, when the
/// conflict values do not match the conflict columns in length, when a
/// conflict column without an explicit value is missing from the record, or
/// when a float is not finite.
///
/// # Examples
///
/// ```
/// use dbkit::record;
/// use dbkit::sql::{InsertOptions, build_insert};
///
/// let sql = build_insert(
///     "users",
///     &record! { "id" => 1, "name" => "a" },
///     &InsertOptions::new().update_columns(["name"]),
/// )
/// .unwrap();
///
/// assert_eq!(
///     sql,
///     "insert into `users` (`id`, `name`) values (1, 'a') on duplicate key update `name`=values(`name`)"
/// );
/// ```
pub fn build_insert(
    table: &str,
    record: &Record,
    options: &InsertOptions,
) -> Result<String, StoreError> {
    check_value_count(options)?;
    if record.is_empty() {
        return Err(StoreError::validation(format!(
            "cannot build insert into {table} from an empty record"
        )));
    }

    let columns = column_list(record.keys());
    let values = record
        .values()
        .map(|value| render_literal(&value.coerce()))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let ignore = options.ignore_choice().unwrap_or(false);

    let sql = match options.mode() {
        InsertMode::ReplaceAll => {
            format!("replace into {} ({columns}) values ({values})", quote_table(table))
        }
        InsertMode::Plain => format!(
            "{} into {} ({columns}) values ({values})",
            insert_keyword(ignore),
            quote_table(table)
        ),
        InsertMode::UpdateColumns => {
            let known: IndexSet<&str> = record.keys().map(String::as_str).collect();
            format!(
                "{} into {} ({columns}) values ({values}) on duplicate key update {}",
                insert_keyword(ignore),
                quote_table(table),
                update_clause(options, &known)?
            )
        }
    };
    Ok(sql)
}

// =============================================================================
// Batch
// =============================================================================

/// Renders a parameterized single-row insert and the coerced rows to bind.
///
/// The column set is the union of every record's keys in first-seen order;
/// keys a record lacks bind as null. A plain insert renders `insert ignore`
/// unless the caller chose otherwise.
///
/// # Errors
///
/// Returns [`StoreError::Validation`] when `records` is empty or has no
/// columns, on conflict column/value length mismatch, when a conflict column
/// without an explicit value is not part of the column set, or when a float
/// is not finite.
///
/// # Examples
///
/// ```
/// use dbkit::record;
/// use dbkit::record::SqlValue;
/// use dbkit::sql::{InsertOptions, build_batch_insert};
///
/// let (sql, rows) = build_batch_insert(
///     "t",
///     &[record! { "a" => 1 }, record! { "b" => "x" }],
///     &InsertOptions::new(),
/// )
/// .unwrap();
///
/// assert_eq!(sql, "insert ignore into `t` (`a`, `b`) values (?, ?)");
/// assert_eq!(rows[0], vec![SqlValue::Integer(1), SqlValue::Null]);
/// assert_eq!(rows[1], vec![SqlValue::Null, SqlValue::Text("x".into())]);
/// ```
pub fn build_batch_insert(
    table: &str,
    records: &[Record],
    options: &InsertOptions,
) -> Result<BatchStatement, StoreError> {
    check_value_count(options)?;
    if records.is_empty() {
        return Err(StoreError::validation(format!(
            "cannot build batch insert into {table} without records"
        )));
    }

    let known: IndexSet<&str> = records
        .iter()
        .flat_map(|record| record.keys().map(String::as_str))
        .collect();
    if known.is_empty() {
        return Err(StoreError::validation(format!(
            "cannot build batch insert into {table}: records have no columns"
        )));
    }

    let columns = column_list(known.iter().copied());
    let placeholders = vec!["?"; known.len()].join(", ");

    let sql = match options.mode() {
        InsertMode::ReplaceAll => format!(
            "replace into {} ({columns}) values ({placeholders})",
            quote_table(table)
        ),
        InsertMode::Plain => format!(
            "{} into {} ({columns}) values ({placeholders})",
            insert_keyword(options.ignore_choice().unwrap_or(true)),
            quote_table(table)
        ),
        InsertMode::UpdateColumns => format!(
            "{} into {} ({columns}) values ({placeholders}) on duplicate key update {}",
            insert_keyword(options.ignore_choice().unwrap_or(false)),
            quote_table(table),
            update_clause(options, &known)?
        ),
    };

    let rows = records
        .iter()
        .map(|record| {
            known
                .iter()
                .map(|column| {
                    let value = record.get(*column).map_or(SqlValue::Null, Value::coerce);
                    check_finite(column, value)
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok((sql, rows))
}

// =============================================================================
// Update / Condition
// =============================================================================

/// Renders `update <table> set ... where <clause>`.
///
/// `where_clause` is inserted verbatim; it is caller-trusted text.
///
/// # Errors
///
/// Returns [`StoreError::Validation`] when the record is empty, the clause is
/// blank, or a float is not finite.
///
/// # Examples
///
/// ```
/// use dbkit::record;
/// use dbkit::sql::build_conditional_update;
///
/// let sql = build_conditional_update("t", &record! { "a" => "x", "b" => 1 }, "id=3").unwrap();
/// assert_eq!(sql, "update `t` set `a`='x', `b`=1 where id=3");
///
/// assert!(build_conditional_update("t", &record! { "a" => 1 }, "  ").is_err());
/// ```
pub fn build_conditional_update(
    table: &str,
    record: &Record,
    where_clause: &str,
) -> Result<String, StoreError> {
    if record.is_empty() {
        return Err(StoreError::validation(format!(
            "cannot build update of {table} from an empty record"
        )));
    }
    if where_clause.trim().is_empty() {
        return Err(StoreError::validation(format!(
            "refusing to build update of {table} without a where clause"
        )));
    }

    let assignments = record
        .iter()
        .map(|(column, value)| {
            Ok(format!(
                "{}={}",
                quote_identifier(column),
                render_literal(&value.coerce())?
            ))
        })
        .collect::<Result<Vec<_>, StoreError>>()?
        .join(", ");

    Ok(format!(
        "update {} set {assignments} where {where_clause}",
        quote_table(table)
    ))
}

/// Renders a conflict key as a conjunction of equality tests.
///
/// # Errors
///
/// Returns [`StoreError::ConflictResolution`] for an empty key, and
/// [`StoreError::Validation`] for a non-finite float.
///
/// # Examples
///
/// ```
/// use dbkit::record;
/// use dbkit::sql::build_where_condition;
///
/// let condition = build_where_condition(&record! { "a" => 1, "b" => None::<i64> }).unwrap();
/// assert_eq!(condition, "`a`=1 and `b` is null");
/// ```
pub fn build_where_condition(key: &Record) -> Result<String, StoreError> {
    if key.is_empty() {
        return Err(StoreError::conflict_resolution(
            "conflict key is empty; refusing to build an unbounded condition",
        ));
    }

    let terms = key
        .iter()
        .map(|(column, value)| {
            let literal = value.coerce();
            if literal.is_null() {
                Ok(format!("{} is null", quote_identifier(column)))
            } else {
                Ok(format!(
                    "{}={}",
                    quote_identifier(column),
                    render_literal(&literal)?
                ))
            }
        })
        .collect::<Result<Vec<_>, StoreError>>()?;

    Ok(terms.join(" and "))
}

// =============================================================================
// Helpers
// =============================================================================

const fn insert_keyword(ignore: bool) -> &'static str {
    if ignore { "insert ignore" } else { "insert" }
}

fn column_list<S: AsRef<str>>(columns: impl IntoIterator<Item = S>) -> String {
    columns
        .into_iter()
        .map(|column| quote_identifier(column.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn check_value_count(options: &InsertOptions) -> Result<(), StoreError> {
    match options.values() {
        Some(values) if values.len() != options.columns().len() => {
            Err(StoreError::validation(format!(
                "{} conflict values supplied for {} conflict columns",
                values.len(),
                options.columns().len()
            )))
        }
        _ => Ok(()),
    }
}

fn update_clause(options: &InsertOptions, known: &IndexSet<&str>) -> Result<String, StoreError> {
    let assignments = match options.values() {
        Some(values) => options
            .columns()
            .iter()
            .zip(values)
            .map(|(column, value)| {
                Ok(format!(
                    "{}={}",
                    quote_identifier(column),
                    render_literal(&value.coerce())?
                ))
            })
            .collect::<Result<Vec<_>, StoreError>>()?,
        None => options
            .columns()
            .iter()
            .map(|column| {
                if known.contains(column.as_str()) {
                    let quoted = quote_identifier(column);
                    Ok(format!("{quoted}=values({quoted})"))
                } else {
                    Err(StoreError::validation(format!(
                        "conflict column {column} is not part of the inserted columns"
                    )))
                }
            })
            .collect::<Result<Vec<_>, StoreError>>()?,
    };
    Ok(assignments.join(", "))
}

fn check_finite(column: &str, value: SqlValue) -> Result<SqlValue, StoreError> {
    match value {
        SqlValue::Float(number) if !number.is_finite() => Err(StoreError::validation(format!(
            "column {column}: float value {number} has no SQL representation"
        ))),
        other => Ok(other),
    }
}
