//! MongoDB client: queries, updates, index management and batch upserts.

use futures::TryStreamExt;
use mongodb::bson::{Document, doc};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::results::UpdateResult;
use mongodb::{Client, Collection, Database, IndexModel};

use super::MongoConfig;
use super::convert::{document_to_record, record_to_document};
use crate::conflict::{ConflictKeyExtractor, MONGO_DUPLICATE_KEY_CODE, MongoDuplicateKey};
use crate::errors::{Backend, StoreError};
use crate::record::Record;
use crate::upsert::{
    BatchOutcome, FailureReporting, InsertError, OnConflict, UpsertBackend, UpsertExecutor,
};

/// MongoDB client bound to one database.
///
/// Clones share the driver's connection pool.
#[derive(Clone)]
pub struct MongoDb {
    client: Client,
    database: Database,
    reporting: FailureReporting,
}

impl MongoDb {
    /// Connects using `config` and checks the server with `ping`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] for an unparsable URI and
    /// [`StoreError::Connection`] if the server is unreachable.
    pub async fn connect(config: &MongoConfig) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(&config.uri).await.map_err(|error| {
            StoreError::configuration(format!("invalid MongoDB URI ({config:?}): {error}"))
        })?;
        if let Some(timeout) = config.server_selection_timeout {
            options.server_selection_timeout = Some(timeout);
        }
        let client = Client::with_options(options).map_err(|error| {
            StoreError::configuration(format!("invalid MongoDB options: {error}"))
        })?;
        let database = client.database(&config.database);

        database.run_command(doc! { "ping": 1 }).await.map_err(|error| {
            tracing::error!("Failed to connect to MongoDB ({:?}): {}", config, error);
            StoreError::connection(Backend::MongoDb, error.to_string())
        })?;
        tracing::info!("Connected to MongoDB database {}", config.database);

        Ok(Self {
            client,
            database,
            reporting: FailureReporting::default(),
        })
    }

    /// Connects using [`MongoConfig::from_env`].
    ///
    /// # Errors
    ///
    /// See [`MongoDb::connect`].
    pub async fn from_env() -> Result<Self, StoreError> {
        Self::connect(&MongoConfig::from_env()?).await
    }

    /// Sets how unresolved batch items are reported by [`add_batch`](Self::add_batch).
    #[must_use]
    pub const fn with_failure_reporting(mut self, reporting: FailureReporting) -> Self {
        self.reporting = reporting;
        self
    }

    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.database
    }

    #[must_use]
    pub fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }

    /// Shuts the client down, waiting for in-flight operations.
    pub async fn close(self) {
        self.client.shutdown().await;
    }
}

// =============================================================================
// Queries
// =============================================================================

impl MongoDb {
    /// Returns the documents matching `filter`, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn find(
        &self,
        collection: &str,
        filter: Document,
        limit: Option<i64>,
    ) -> Result<Vec<Record>, StoreError> {
        let coll = self.collection(collection);
        let mut action = coll.find(filter.clone());
        if let Some(limit) = limit {
            action = action.limit(limit);
        }
        let documents: Vec<Document> = action
            .await?
            .try_collect()
            .await
            .inspect_err(|error| {
                tracing::error!("Failed to find in {} with {}: {}", collection, filter, error);
            })?;
        Ok(documents.into_iter().map(document_to_record).collect())
    }

    /// Counts the documents matching `filter`, stopping at `limit` if given.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn count(
        &self,
        collection: &str,
        filter: Document,
        limit: Option<u64>,
    ) -> Result<u64, StoreError> {
        let coll = self.collection(collection);
        let mut action = coll.count_documents(filter);
        if let Some(limit) = limit {
            action = action.limit(limit);
        }
        Ok(action.await?)
    }

    /// Sets the fields of `data` on the first document matching `condition`.
    ///
    /// Returns the number of documents modified or upserted.
    ///
    /// # Errors
    ///
    /// Returns the driver error, or [`StoreError::Serialization`] if `data`
    /// cannot be converted.
    pub async fn update(
        &self,
        collection: &str,
        data: &Record,
        condition: Document,
        upsert: bool,
    ) -> Result<u64, StoreError> {
        let update = doc! { "$set": record_to_document(data)? };
        let result = self
            .collection(collection)
            .update_one(condition.clone(), update)
            .upsert(upsert)
            .await
            .inspect_err(|error| {
                tracing::error!("Failed to update {} where {}: {}", collection, condition, error);
            })?;
        Ok(result.modified_count + u64::from(result.upserted_id.is_some()))
    }

    /// Sets the fields of `data` on every document matching `condition`.
    ///
    /// # Errors
    ///
    /// See [`MongoDb::update`].
    pub async fn update_many(
        &self,
        collection: &str,
        data: &Record,
        condition: Document,
        upsert: bool,
    ) -> Result<u64, StoreError> {
        let update = doc! { "$set": record_to_document(data)? };
        let result = self
            .collection(collection)
            .update_many(condition.clone(), update)
            .upsert(upsert)
            .await
            .inspect_err(|error| {
                tracing::error!("Failed to update {} where {}: {}", collection, condition, error);
            })?;
        Ok(result.modified_count + u64::from(result.upserted_id.is_some()))
    }

    /// Updates each record's document, matched on `condition_field`.
    ///
    /// Every record is applied even if some fail; failures are logged. Returns
    /// the number of documents modified or upserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if a record lacks `condition_field`.
    pub async fn update_batch(
        &self,
        collection: &str,
        records: &[Record],
        condition_field: &str,
        upsert: bool,
    ) -> Result<u64, StoreError> {
        let mut conditions = Vec::with_capacity(records.len());
        for record in records {
            let value = record.get(condition_field).ok_or_else(|| {
                StoreError::validation(format!(
                    "record is missing condition field {condition_field}"
                ))
            })?;
            let mut condition = Record::new();
            condition.insert(condition_field.to_string(), value.clone());
            conditions.push(record_to_document(&condition)?);
        }

        let mut changed = 0;
        for (record, condition) in records.iter().zip(conditions) {
            match self.update(collection, record, condition, upsert).await {
                Ok(count) => changed += count,
                Err(error) => {
                    tracing::error!("Failed to apply batch update to {}: {}", collection, error);
                }
            }
        }
        Ok(changed)
    }

    /// Deletes the first document matching `condition`.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn delete(&self, collection: &str, condition: Document) -> Result<u64, StoreError> {
        let result = self
            .collection(collection)
            .delete_one(condition.clone())
            .await
            .inspect_err(|error| {
                tracing::error!("Failed to delete from {} where {}: {}", collection, condition, error);
            })?;
        Ok(result.deleted_count)
    }

    /// Runs a database command.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn run_command(&self, command: Document) -> Result<Document, StoreError> {
        Ok(self.database.run_command(command).await?)
    }

    /// Creates an ascending index on `keys` and returns its name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for empty `keys` or the driver error.
    pub async fn create_index(
        &self,
        collection: &str,
        keys: &[&str],
        unique: bool,
    ) -> Result<String, StoreError> {
        if keys.is_empty() {
            return Err(StoreError::validation("index needs at least one key"));
        }
        let mut key_document = Document::new();
        for key in keys {
            key_document.insert(*key, 1_i32);
        }
        let model = IndexModel::builder()
            .keys(key_document)
            .options(IndexOptions::builder().unique(unique).build())
            .build();
        let result = self.collection(collection).create_index(model).await?;
        Ok(result.index_name)
    }

    /// Names of the indexes on `collection`.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn index_names(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.collection(collection).list_index_names().await?)
    }

    /// Drops `collection`.
    ///
    /// # Errors
    ///
    /// Returns the driver error.
    pub async fn drop_collection(&self, collection: &str) -> Result<(), StoreError> {
        Ok(self.collection(collection).drop().await?)
    }
}

// =============================================================================
// Upserts
// =============================================================================

impl MongoDb {
    /// Inserts `record`, resolving a duplicate key per `on_conflict`.
    ///
    /// Returns 1 if inserted and 0 if the conflict was resolved or ignored.
    ///
    /// # Errors
    ///
    /// See [`UpsertExecutor::add`].
    pub async fn add(
        &self,
        collection: &str,
        record: &Record,
        on_conflict: &OnConflict,
    ) -> Result<u64, StoreError> {
        UpsertExecutor::new(self.clone())
            .add(collection, record, on_conflict)
            .await
    }

    /// Bulk-inserts `records` unordered, then resolves every duplicate per
    /// `on_conflict`.
    ///
    /// # Errors
    ///
    /// See [`UpsertExecutor::add_batch`].
    pub async fn add_batch(
        &self,
        collection: &str,
        records: &[Record],
        on_conflict: &OnConflict,
        condition_fields: &[&str],
    ) -> Result<BatchOutcome, StoreError> {
        UpsertExecutor::new(self.clone())
            .with_failure_reporting(self.reporting)
            .add_batch(collection, records, on_conflict, condition_fields)
            .await
    }
}

impl UpsertBackend for MongoDb {
    fn kind(&self) -> Backend {
        Backend::MongoDb
    }

    async fn insert(&self, target: &str, record: &Record) -> Result<(), StoreError> {
        let document = record_to_document(record)?;
        self.collection(target).insert_one(document).await?;
        Ok(())
    }

    async fn insert_many(
        &self,
        target: &str,
        records: &[Record],
    ) -> Result<Vec<InsertError>, StoreError> {
        let documents = records
            .iter()
            .map(record_to_document)
            .collect::<Result<Vec<_>, _>>()?;

        let error = match self.collection(target).insert_many(documents).ordered(false).await {
            Ok(_) => return Ok(Vec::new()),
            Err(error) => error,
        };

        match error.kind.as_ref() {
            ErrorKind::InsertMany(failure) => {
                if let Some(concern) = &failure.write_concern_error {
                    tracing::warn!("Write concern error inserting into {}: {:?}", target, concern);
                }
                Ok(failure
                    .write_errors
                    .iter()
                    .flatten()
                    .map(|write_error| InsertError {
                        index: write_error.index,
                        duplicate: write_error.code == MONGO_DUPLICATE_KEY_CODE,
                        message: write_error.message.clone(),
                    })
                    .collect())
            }
            _ => {
                tracing::error!("Failed to bulk insert into {}: {}", target, error);
                Err(error.into())
            }
        }
    }

    async fn conflict_key(
        &self,
        _target: &str,
        message: &str,
        record: &Record,
    ) -> Result<Record, StoreError> {
        MongoDuplicateKey.extract_conflict_key(message, record)
    }

    async fn update(
        &self,
        target: &str,
        condition: &Record,
        assignments: &Record,
    ) -> Result<u64, StoreError> {
        let condition = record_to_document(condition)?;
        let update = doc! { "$set": record_to_document(assignments)? };
        let result = self
            .collection(target)
            .update_one(condition, update)
            .await?;
        Ok(resolved_count(&result))
    }

    async fn replace(
        &self,
        target: &str,
        condition: &Record,
        record: &Record,
    ) -> Result<u64, StoreError> {
        let condition = record_to_document(condition)?;
        let replacement = record_to_document(record)?;
        let result = self
            .collection(target)
            .replace_one(condition, replacement)
            .await?;
        Ok(resolved_count(&result))
    }
}

/// Documents a conflict resolution reached. Re-writing identical values
/// matches without modifying, which still resolves the conflict.
const fn resolved_count(result: &UpdateResult) -> u64 {
    result.matched_count
}

impl std::fmt::Debug for MongoDb {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("MongoDb")
            .field("database", &self.database.name())
            .field("reporting", &self.reporting)
            .finish_non_exhaustive()
    }
}
