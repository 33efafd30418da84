//! MySQL client: queries, inserts, batch inserts and duplicate-key upserts.

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, MySql, Row, TypeInfo, ValueRef};
use tokio::sync::RwLock;

use super::{MySqlPool, MySqlPoolConfig, MySqlPoolFactory};
use crate::conflict::{ConflictKeyExtractor, MySqlDuplicateKey};
use crate::errors::{Backend, StoreError};
use crate::record::{Record, SqlValue, Value, format_date, format_date_time, format_time};
use crate::sql::{
    InsertOptions, build_batch_insert, build_conditional_update, build_insert,
    build_where_condition, quote_table,
};
use crate::upsert::{
    BatchOutcome, FailureReporting, InsertError, OnConflict, UpsertBackend, UpsertExecutor,
};

/// Unique key name to its ordered columns.
type IndexColumns = HashMap<String, Vec<String>>;

// =============================================================================
// Options / Results
// =============================================================================

/// How [`MySqlDb::find`] shapes its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOptions {
    /// Maximum number of rows to return; `None` returns all.
    pub limit: Option<usize>,
    /// Decode text cells that look like JSON objects or arrays.
    pub decode_json: bool,
    /// Return dates and times as text instead of temporal values.
    pub temporal_as_text: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: None,
            decode_json: false,
            temporal_as_text: true,
        }
    }
}

impl FindOptions {
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn with_decode_json(mut self, decode_json: bool) -> Self {
        self.decode_json = decode_json;
        self
    }

    #[must_use]
    pub const fn with_temporal_as_text(mut self, temporal_as_text: bool) -> Self {
        self.temporal_as_text = temporal_as_text;
        self
    }
}

/// Result of a single insert statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

// =============================================================================
// MySqlDb
// =============================================================================

/// MySQL client over a shared [`MySqlPool`].
///
/// Clones share the pool and the unique-index cache.
///
/// # Examples
///
/// ```rust,ignore
/// use dbkit::adapters::mysql::MySqlDb;
/// use dbkit::record;
/// use dbkit::upsert::OnConflict;
///
/// let db = MySqlDb::from_env().await?;
/// let inserted = db
///     .add("users", &record! { "id" => 1, "name" => "b" }, &OnConflict::update(["name"]))
///     .await?;
/// ```
#[derive(Clone)]
pub struct MySqlDb {
    pool: MySqlPool,
    index_cache: Arc<RwLock<HashMap<String, IndexColumns>>>,
    reporting: FailureReporting,
}

impl MySqlDb {
    #[must_use]
    pub fn new(pool: MySqlPool) -> Self {
        Self {
            pool,
            index_cache: Arc::new(RwLock::new(HashMap::new())),
            reporting: FailureReporting::default(),
        }
    }

    /// Connects using `config`.
    ///
    /// # Errors
    ///
    /// See [`MySqlPoolFactory::create_pool`].
    pub async fn connect(config: &MySqlPoolConfig) -> Result<Self, StoreError> {
        MySqlPoolFactory::create_pool(config).await.map(Self::new)
    }

    /// Connects using [`MySqlPoolConfig::from_env`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for missing variables and
    /// [`StoreError::Connection`] if the server is unreachable.
    pub async fn from_env() -> Result<Self, StoreError> {
        Self::connect(&MySqlPoolConfig::from_env()?).await
    }

    /// Sets how failed rows are reported by batch operations.
    #[must_use]
    pub const fn with_failure_reporting(mut self, reporting: FailureReporting) -> Self {
        self.reporting = reporting;
        self
    }

    #[must_use]
    pub const fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// =============================================================================
// Queries
// =============================================================================

impl MySqlDb {
    /// Runs a query and returns its rows as records.
    ///
    /// # Errors
    ///
    /// Returns the driver error if the query fails or a cell cannot be decoded.
    pub async fn find(&self, sql: &str, options: FindOptions) -> Result<Vec<Record>, StoreError> {
        let mut stream = sqlx::query(sql).fetch(self.pool.as_inner());
        let mut records = Vec::new();

        while options.limit.is_none_or(|limit| records.len() < limit) {
            let row = match stream.try_next().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!("Failed to query {}: {}", sql, error);
                    return Err(error.into());
                }
            };
            records.push(decode_row(&row, options)?);
        }
        Ok(records)
    }

    /// Executes an insert statement.
    ///
    /// # Errors
    ///
    /// Returns the driver error; a duplicate key surfaces as
    /// [`StoreError::DuplicateKey`].
    pub async fn execute_insert(&self, sql: &str) -> Result<InsertResult, StoreError> {
        let result = sqlx::query(sql)
            .execute(self.pool.as_inner())
            .await
            .inspect_err(|error| tracing::error!("Failed to insert {}: {}", sql, error))?;
        Ok(InsertResult {
            rows_affected: result.rows_affected(),
            last_insert_id: result.last_insert_id(),
        })
    }

    /// Builds and executes an insert of `record` into `table`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] from the statement builder or the
    /// driver error.
    pub async fn insert(
        &self,
        table: &str,
        record: &Record,
        options: &InsertOptions,
    ) -> Result<InsertResult, StoreError> {
        let sql = build_insert(table, record, options)?;
        self.execute_insert(&sql).await
    }

    /// Executes the parameterized statement once per row on one connection.
    ///
    /// A failing row is logged and recorded in the outcome; the remaining rows
    /// still run. Each row is classified by [`classify_row`]. An
    /// `on duplicate key update` statement first runs as a plain insert, and
    /// only a row that collides runs the full statement, so an update that
    /// rewrites identical values still counts as updated.
    ///
    /// # Errors
    ///
    /// Returns an error only if no connection could be acquired.
    pub async fn insert_batch(
        &self,
        sql: &str,
        rows: &[Vec<SqlValue>],
    ) -> Result<BatchOutcome, StoreError> {
        let kind = StatementKind::of(sql);
        let head = upsert_head(sql);
        let mut connection = self.pool.as_inner().acquire().await?;
        let mut outcome = BatchOutcome::new(rows.len());

        for (index, row) in rows.iter().enumerate() {
            let settled = match &head {
                Some(head) => match execute_row(&mut *connection, head, row).await {
                    Ok(affected) => Ok(classify_row(StatementKind::Insert, affected)),
                    Err(StoreError::DuplicateKey { .. }) => execute_row(&mut *connection, sql, row)
                        .await
                        .map(|affected| classify_row(kind, affected)),
                    Err(error) => Err(error),
                },
                None => execute_row(&mut *connection, sql, row)
                    .await
                    .map(|affected| classify_row(kind, affected)),
            };
            match settled {
                Ok(RowOutcome::Inserted) => {}
                Ok(RowOutcome::Updated) => outcome.updated += 1,
                Ok(RowOutcome::Replaced) => outcome.replaced += 1,
                Ok(RowOutcome::Skipped) => outcome.skipped += 1,
                Err(error) => {
                    tracing::error!("Failed to insert row {} with {}: {}", index, sql, error);
                    outcome.record_failure(self.reporting, index, error.to_string());
                }
            }
        }
        Ok(outcome.finish())
    }

    /// Builds a batch statement for `records` and runs it with
    /// [`insert_batch`](Self::insert_batch).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] from the statement builder, or an
    /// error if no connection could be acquired.
    pub async fn insert_batch_records(
        &self,
        table: &str,
        records: &[Record],
        options: &InsertOptions,
    ) -> Result<BatchOutcome, StoreError> {
        let (sql, rows) = build_batch_insert(table, records, options)?;
        self.insert_batch(&sql, &rows).await
    }

    /// Executes an update statement and returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn update(&self, sql: &str) -> Result<u64, StoreError> {
        self.execute(sql).await
    }

    /// Updates `table` with `record` where `condition` holds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an empty record or blank
    /// condition, or the driver error.
    pub async fn update_record(
        &self,
        table: &str,
        record: &Record,
        condition: &str,
    ) -> Result<u64, StoreError> {
        let sql = build_conditional_update(table, record, condition)?;
        self.execute(&sql).await
    }

    /// Executes a delete statement and returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn delete(&self, sql: &str) -> Result<u64, StoreError> {
        self.execute(sql).await
    }

    /// Executes any statement and returns the affected row count.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn execute(&self, sql: &str) -> Result<u64, StoreError> {
        sqlx::query(sql)
            .execute(self.pool.as_inner())
            .await
            .map(|result| result.rows_affected())
            .map_err(|error| {
                tracing::error!("Failed to execute {}: {}", sql, error);
                error.into()
            })
    }
}

// =============================================================================
// Upserts
// =============================================================================

impl MySqlDb {
    /// Inserts `record`, resolving a duplicate key per `on_conflict`.
    ///
    /// Returns 1 if inserted and 0 if the conflict was resolved or ignored.
    ///
    /// # Errors
    ///
    /// See [`UpsertExecutor::add`].
    pub async fn add(
        &self,
        table: &str,
        record: &Record,
        on_conflict: &OnConflict,
    ) -> Result<u64, StoreError> {
        UpsertExecutor::new(self.clone())
            .add(table, record, on_conflict)
            .await
    }

    /// Inserts `records` row by row, then resolves every duplicate per
    /// `on_conflict`.
    ///
    /// # Errors
    ///
    /// See [`UpsertExecutor::add_batch`].
    pub async fn add_batch(
        &self,
        table: &str,
        records: &[Record],
        on_conflict: &OnConflict,
        condition_fields: &[&str],
    ) -> Result<BatchOutcome, StoreError> {
        UpsertExecutor::new(self.clone())
            .with_failure_reporting(self.reporting)
            .add_batch(table, records, on_conflict, condition_fields)
            .await
    }

    /// Unique keys of `table` and their columns, loaded once and cached.
    ///
    /// # Errors
    ///
    /// Returns the driver error if `SHOW INDEX` fails.
    pub async fn index_columns(&self, table: &str) -> Result<IndexColumns, StoreError> {
        if let Some(columns) = self.index_cache.read().await.get(table) {
            return Ok(columns.clone());
        }

        let sql = format!("show index from {}", quote_table(table));
        let rows = sqlx::query(&sql)
            .fetch_all(self.pool.as_inner())
            .await
            .inspect_err(|error| tracing::error!("Failed to load indexes of {}: {}", table, error))?;

        let mut ordered: Vec<(String, i64, String)> = Vec::new();
        for row in &rows {
            let non_unique: i64 = row.try_get_unchecked("Non_unique")?;
            let column: Option<String> = row.try_get("Column_name")?;
            if non_unique != 0 {
                continue;
            }
            let Some(column) = column else {
                continue;
            };
            ordered.push((
                row.try_get("Key_name")?,
                row.try_get_unchecked("Seq_in_index")?,
                column,
            ));
        }
        ordered.sort_by(|left, right| (&left.0, left.1).cmp(&(&right.0, right.1)));

        let mut columns = IndexColumns::new();
        for (key, _, column) in ordered {
            columns.entry(key).or_default().push(column);
        }

        self.index_cache
            .write()
            .await
            .insert(table.to_string(), columns.clone());
        Ok(columns)
    }
}

impl UpsertBackend for MySqlDb {
    fn kind(&self) -> Backend {
        Backend::MySql
    }

    async fn insert(&self, target: &str, record: &Record) -> Result<(), StoreError> {
        let sql = build_insert(target, record, &InsertOptions::new())?;
        sqlx::query(&sql)
            .execute(self.pool.as_inner())
            .await
            .map(|_| ())
            .map_err(StoreError::from)
    }

    async fn insert_many(
        &self,
        target: &str,
        records: &[Record],
    ) -> Result<Vec<InsertError>, StoreError> {
        let mut connection = self.pool.as_inner().acquire().await?;
        let mut errors = Vec::new();

        for (index, record) in records.iter().enumerate() {
            let result = match build_insert(target, record, &InsertOptions::new()) {
                Ok(sql) => sqlx::query(&sql)
                    .execute(&mut *connection)
                    .await
                    .map(|_| ())
                    .map_err(StoreError::from),
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                let (duplicate, message) = match error {
                    StoreError::DuplicateKey { message, .. } => (true, message),
                    other => (false, other.to_string()),
                };
                errors.push(InsertError {
                    index,
                    duplicate,
                    message,
                });
            }
        }
        Ok(errors)
    }

    async fn conflict_key(
        &self,
        target: &str,
        message: &str,
        record: &Record,
    ) -> Result<Record, StoreError> {
        let columns = self.index_columns(target).await?;
        MySqlDuplicateKey::new(columns).extract_conflict_key(message, record)
    }

    async fn update(
        &self,
        target: &str,
        condition: &Record,
        assignments: &Record,
    ) -> Result<u64, StoreError> {
        let where_clause = build_where_condition(condition)?;
        let sql = build_conditional_update(target, assignments, &where_clause)?;
        self.execute(&sql).await
    }

    async fn replace(
        &self,
        target: &str,
        _condition: &Record,
        record: &Record,
    ) -> Result<u64, StoreError> {
        let sql = build_insert(target, record, &InsertOptions::new().replace_all())?;
        self.execute(&sql).await
    }
}

impl std::fmt::Debug for MySqlDb {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MySqlDb")
            .field("pool", &self.pool)
            .field("reporting", &self.reporting)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Batch Classification
// =============================================================================

const UPSERT_CLAUSE: &str = " on duplicate key update ";

/// The shape of a batch statement, read from its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// `insert [ignore] into ...`
    Insert,
    /// `replace into ...`
    Replace,
    /// `insert [ignore] into ... on duplicate key update ...`
    Upsert,
}

impl StatementKind {
    #[must_use]
    pub fn of(sql: &str) -> Self {
        let lowered = sql.trim_start().to_ascii_lowercase();
        if lowered.starts_with("replace") {
            Self::Replace
        } else if lowered.contains(UPSERT_CLAUSE) {
            Self::Upsert
        } else {
            Self::Insert
        }
    }
}

/// What executing one batch row did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Inserted,
    Updated,
    Replaced,
    Skipped,
}

/// Classifies one executed row from the statement that settled it and its
/// affected-row count.
///
/// sqlx connects with `CLIENT_FOUND_ROWS`, so counts are matched rows:
/// - `insert`: 1 inserted, 0 ignored by `insert ignore`
/// - `replace`: 1 inserted, 2 deleted and re-inserted
/// - upsert: only run for a row whose plain insert collided, so any count
///   is an update
#[must_use]
pub const fn classify_row(kind: StatementKind, rows_affected: u64) -> RowOutcome {
    match (kind, rows_affected) {
        (StatementKind::Upsert, _) => RowOutcome::Updated,
        (_, 0) => RowOutcome::Skipped,
        (StatementKind::Replace, 2..) => RowOutcome::Replaced,
        _ => RowOutcome::Inserted,
    }
}

/// The plain insert an upsert statement starts with, without `ignore` so a
/// collision surfaces as a duplicate key. `None` for other statements.
fn upsert_head(sql: &str) -> Option<String> {
    let sql = sql.trim_start();
    let lowered = sql.to_ascii_lowercase();
    let position = lowered.find(UPSERT_CLAUSE)?;
    let head = sql[..position].trim_end();
    if lowered.starts_with("insert ignore ") {
        return Some(format!("insert {}", head["insert ignore ".len()..].trim_start()));
    }
    Some(head.to_string())
}

async fn execute_row(
    connection: &mut sqlx::MySqlConnection,
    sql: &str,
    row: &[SqlValue],
) -> Result<u64, StoreError> {
    row.iter()
        .fold(sqlx::query(sql), bind_value)
        .execute(connection)
        .await
        .map(|result| result.rows_affected())
        .map_err(StoreError::from)
}

// =============================================================================
// Row Decoding
// =============================================================================

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &SqlValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        SqlValue::Null => query.bind(None::<String>),
        SqlValue::Integer(number) => query.bind(*number),
        SqlValue::Float(number) => query.bind(*number),
        SqlValue::Text(text) => query.bind(text.clone()),
    }
}

fn decode_row(row: &MySqlRow, options: FindOptions) -> Result<Record, StoreError> {
    row.columns()
        .iter()
        .map(|column| {
            let value = decode_cell(row, column.ordinal(), options)?;
            Ok((column.name().to_string(), value))
        })
        .collect()
}

fn decode_cell(row: &MySqlRow, index: usize, options: FindOptions) -> Result<Value, StoreError> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();

    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get(index)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => Value::Int(row.try_get(index)?),
        "YEAR" => Value::Int(row.try_get_unchecked(index)?),
        name if name.ends_with("UNSIGNED") => {
            let number: u64 = row.try_get(index)?;
            i64::try_from(number).map_or_else(|_| Value::Text(number.to_string()), Value::Int)
        }
        "FLOAT" => Value::Float(f64::from(row.try_get::<f32, _>(index)?)),
        "DOUBLE" => Value::Float(row.try_get(index)?),
        "DATE" => {
            let date = row.try_get(index)?;
            if options.temporal_as_text {
                Value::Text(format_date(date))
            } else {
                Value::Date(date)
            }
        }
        "TIME" => {
            let time = row.try_get(index)?;
            if options.temporal_as_text {
                Value::Text(format_time(time))
            } else {
                Value::Time(time)
            }
        }
        "DATETIME" | "TIMESTAMP" => {
            let date_time = row.try_get(index)?;
            if options.temporal_as_text {
                Value::Text(format_date_time(date_time))
            } else {
                Value::DateTime(date_time)
            }
        }
        "JSON" => Value::Json(row.try_get(index)?),
        "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => {
            let bytes: Vec<u8> = row.try_get_unchecked(index)?;
            Value::Text(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => text_value(row.try_get_unchecked(index)?, options),
    };
    Ok(value)
}

fn text_value(text: String, options: FindOptions) -> Value {
    if options.decode_json && looks_like_json(&text) {
        if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
            return Value::Json(json);
        }
    }
    Value::Text(text)
}

fn looks_like_json(text: &str) -> bool {
    let trimmed = text.trim();
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    mod classification_tests {
        use super::*;

        #[rstest]
        #[case::insert("insert into `t` (`a`) values (?)", StatementKind::Insert)]
        #[case::insert_ignore("insert ignore into `t` (`a`) values (?)", StatementKind::Insert)]
        #[case::replace(" REPLACE into `t` (`a`) values (?)", StatementKind::Replace)]
        #[case::upsert(
            "insert into `t` (`a`) values (?) on duplicate key update `a`=values(`a`)",
            StatementKind::Upsert
        )]
        fn statement_kind_from_text(#[case] sql: &str, #[case] expected: StatementKind) {
            assert_eq!(StatementKind::of(sql), expected);
        }

        #[rstest]
        #[case(StatementKind::Insert, 0, RowOutcome::Skipped)]
        #[case(StatementKind::Insert, 1, RowOutcome::Inserted)]
        #[case(StatementKind::Replace, 1, RowOutcome::Inserted)]
        #[case(StatementKind::Replace, 2, RowOutcome::Replaced)]
        #[case(StatementKind::Replace, 0, RowOutcome::Skipped)]
        #[case(StatementKind::Upsert, 1, RowOutcome::Updated)]
        #[case(StatementKind::Upsert, 2, RowOutcome::Updated)]
        fn rows_are_classified_by_statement_and_count(
            #[case] kind: StatementKind,
            #[case] rows_affected: u64,
            #[case] expected: RowOutcome,
        ) {
            assert_eq!(classify_row(kind, rows_affected), expected);
        }

        #[rstest]
        #[case(
            "insert into `t` (`a`, `b`) values (?, ?) on duplicate key update `b`=values(`b`)",
            Some("insert into `t` (`a`, `b`) values (?, ?)")
        )]
        #[case(
            "insert ignore into `t` (`a`) values (?) on duplicate key update `a`='x'",
            Some("insert into `t` (`a`) values (?)")
        )]
        #[case("insert ignore into `t` (`a`) values (?)", None)]
        #[case("replace into `t` (`a`) values (?)", None)]
        fn upsert_head_is_a_plain_insert(#[case] sql: &str, #[case] expected: Option<&str>) {
            assert_eq!(upsert_head(sql).as_deref(), expected);
        }
    }

    #[rstest]
    fn find_options_default_returns_temporal_text() {
        let options = FindOptions::default();
        assert_eq!(options.limit, None);
        assert!(options.temporal_as_text);
        assert!(!options.decode_json);
    }

    #[rstest]
    #[case(r#"{"a": 1}"#, true)]
    #[case(" [1, 2] ", true)]
    #[case("{broken", false)]
    #[case("plain", false)]
    fn json_detection(#[case] text: &str, #[case] expected: bool) {
        assert_eq!(looks_like_json(text), expected);
    }

    #[rstest]
    fn text_value_decodes_json_only_when_asked() {
        let decoding = FindOptions::default().with_decode_json(true);
        assert_eq!(
            text_value(r#"{"a":1}"#.to_string(), decoding),
            Value::Json(json!({"a": 1}))
        );
        assert_eq!(
            text_value(r#"{"a":1}"#.to_string(), FindOptions::default()),
            Value::Text(r#"{"a":1}"#.to_string())
        );
    }

    #[rstest]
    fn invalid_json_stays_text() {
        let decoding = FindOptions::default().with_decode_json(true);
        assert_eq!(
            text_value("{not json}".to_string(), decoding),
            Value::Text("{not json}".to_string())
        );
    }
}
