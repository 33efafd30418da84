//! Backend-agnostic insert-then-resolve logic.

use super::outcome::{BatchOutcome, FailureReporting};
use super::policy::OnConflict;
use crate::errors::{Backend, StoreError};
use crate::record::Record;

/// A per-item error from [`UpsertBackend::insert_many`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertError {
    /// Position of the item in the submitted batch.
    pub index: usize,
    /// Whether the error is a uniqueness violation.
    pub duplicate: bool,
    pub message: String,
}

/// The write capabilities an [`UpsertExecutor`] drives.
///
/// `target` is a table or collection name.
pub trait UpsertBackend: Send + Sync {
    /// The backend kind, used in logs and errors.
    fn kind(&self) -> Backend;

    /// Inserts one record.
    ///
    /// A uniqueness violation must surface as [`StoreError::DuplicateKey`].
    fn insert(
        &self,
        target: &str,
        record: &Record,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Inserts every record without stopping at the first failure.
    ///
    /// Returns the per-item errors; an `Err` means nothing could be attempted.
    fn insert_many(
        &self,
        target: &str,
        records: &[Record],
    ) -> impl Future<Output = Result<Vec<InsertError>, StoreError>> + Send;

    /// Derives the conflicting key from duplicate-key error text.
    fn conflict_key(
        &self,
        target: &str,
        message: &str,
        record: &Record,
    ) -> impl Future<Output = Result<Record, StoreError>> + Send;

    /// Applies `assignments` to whatever matches `condition`.
    ///
    /// Returns the number of matched rows, whether or not their values
    /// changed.
    fn update(
        &self,
        target: &str,
        condition: &Record,
        assignments: &Record,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;

    /// Replaces whatever matches `condition` with `record`.
    ///
    /// Returns the number of matched rows.
    fn replace(
        &self,
        target: &str,
        condition: &Record,
        record: &Record,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// Runs inserts and resolves duplicate-key conflicts per [`OnConflict`].
#[derive(Debug, Clone)]
pub struct UpsertExecutor<B> {
    backend: B,
    reporting: FailureReporting,
}

impl<B: UpsertBackend> UpsertExecutor<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            reporting: FailureReporting::default(),
        }
    }

    /// Sets how unresolved batch items are reported.
    #[must_use]
    pub const fn with_failure_reporting(mut self, reporting: FailureReporting) -> Self {
        self.reporting = reporting;
        self
    }

    #[must_use]
    pub const fn backend(&self) -> &B {
        &self.backend
    }

    /// Inserts `record`, resolving a duplicate key per `on_conflict`.
    ///
    /// Returns the net insert count: 1 if inserted, 0 if the conflict was
    /// resolved or ignored.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Validation`] for an empty record or update columns the
    ///   record lacks, checked before anything is written
    /// - [`StoreError::DuplicateKey`] under [`OnConflict::Fail`]
    /// - [`StoreError::ConflictResolution`] when no condition can be derived
    ///   or the condition matches no stored row
    /// - any backend error from the insert or the resolution
    pub async fn add(
        &self,
        target: &str,
        record: &Record,
        on_conflict: &OnConflict,
    ) -> Result<u64, StoreError> {
        if record.is_empty() {
            return Err(StoreError::validation(format!(
                "cannot add an empty record to {target}"
            )));
        }
        let assignments = match on_conflict {
            OnConflict::Update(columns) => Some(columns.assignments(record)?),
            _ => None,
        };

        let message = match self.backend.insert(target, record).await {
            Ok(()) => return Ok(1),
            Err(StoreError::DuplicateKey { message, .. }) => message,
            Err(error) => {
                tracing::error!("Failed to insert into {}: {}", target, error);
                return Err(error);
            }
        };

        match on_conflict {
            OnConflict::Fail => Err(StoreError::duplicate_key(self.backend.kind(), message)),
            OnConflict::Ignore => {
                tracing::debug!("Ignoring duplicate in {}: {}", target, message);
                Ok(0)
            }
            OnConflict::Replace => {
                let condition = self.derived_condition(target, &message, record).await?;
                let affected = self.backend.replace(target, &condition, record).await?;
                ensure_matched(target, &condition, affected)
                    .inspect_err(|error| tracing::error!("{}", error))?;
                Ok(0)
            }
            OnConflict::Update(_) => {
                let condition = self.derived_condition(target, &message, record).await?;
                let assignments = assignments.unwrap_or_default();
                let affected = self
                    .backend
                    .update(target, &condition, &assignments)
                    .await?;
                ensure_matched(target, &condition, affected)
                    .inspect_err(|error| tracing::error!("{}", error))?;
                Ok(0)
            }
        }
    }

    /// Inserts `records` unordered, then resolves every duplicate per
    /// `on_conflict`.
    ///
    /// With non-empty `condition_fields` the update condition of a conflicting
    /// record is those fields' values; otherwise it is derived from the error
    /// text. A condition that matches no stored row is a failure for that
    /// record. Failures resolving one record do not stop the others.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] for an empty batch or update columns
    /// a record lacks, and the backend error when the bulk insert could not be
    /// attempted at all.
    pub async fn add_batch(
        &self,
        target: &str,
        records: &[Record],
        on_conflict: &OnConflict,
        condition_fields: &[&str],
    ) -> Result<BatchOutcome, StoreError> {
        if records.is_empty() {
            return Err(StoreError::validation(format!(
                "cannot add an empty batch to {target}"
            )));
        }
        if let OnConflict::Update(columns) = on_conflict {
            for record in records {
                columns.assignments(record)?;
            }
        }

        let errors = self.backend.insert_many(target, records).await?;
        let mut outcome = BatchOutcome::new(records.len());

        for error in errors {
            let Some(record) = records.get(error.index) else {
                tracing::error!(
                    "Bulk insert into {} reported unknown index {}",
                    target,
                    error.index
                );
                continue;
            };
            if !error.duplicate {
                tracing::error!(
                    "Failed to insert item {} into {}: {}",
                    error.index,
                    target,
                    error.message
                );
                outcome.record_failure(self.reporting, error.index, error.message);
                continue;
            }

            let resolution = self
                .resolve_batch_conflict(
                    target,
                    record,
                    &error.message,
                    on_conflict,
                    condition_fields,
                )
                .await;
            match resolution {
                Ok(Resolution::Updated) => outcome.updated += 1,
                Ok(Resolution::Replaced) => outcome.replaced += 1,
                Ok(Resolution::Skipped) => outcome.skipped += 1,
                Err(resolve_error) => {
                    tracing::error!(
                        "Failed to resolve duplicate for item {} in {}: {}",
                        error.index,
                        target,
                        resolve_error
                    );
                    outcome.record_failure(self.reporting, error.index, resolve_error.to_string());
                }
            }
        }

        let outcome = outcome.finish();
        tracing::info!(
            "Batch into {}: attempted {}, inserted {}, updated {}, replaced {}, skipped {}, failed {}",
            target,
            outcome.attempted,
            outcome.inserted,
            outcome.updated,
            outcome.replaced,
            outcome.skipped,
            outcome.failures.len()
        );
        Ok(outcome)
    }

    async fn resolve_batch_conflict(
        &self,
        target: &str,
        record: &Record,
        message: &str,
        on_conflict: &OnConflict,
        condition_fields: &[&str],
    ) -> Result<Resolution, StoreError> {
        match on_conflict {
            OnConflict::Ignore => Ok(Resolution::Skipped),
            OnConflict::Fail => Err(StoreError::duplicate_key(self.backend.kind(), message)),
            OnConflict::Replace => {
                let condition = self
                    .batch_condition(target, record, message, condition_fields)
                    .await?;
                let affected = self.backend.replace(target, &condition, record).await?;
                ensure_matched(target, &condition, affected)?;
                Ok(Resolution::Replaced)
            }
            OnConflict::Update(columns) => {
                let condition = self
                    .batch_condition(target, record, message, condition_fields)
                    .await?;
                let assignments = columns.assignments(record)?;
                let affected = self
                    .backend
                    .update(target, &condition, &assignments)
                    .await?;
                ensure_matched(target, &condition, affected)?;
                Ok(Resolution::Updated)
            }
        }
    }

    async fn batch_condition(
        &self,
        target: &str,
        record: &Record,
        message: &str,
        condition_fields: &[&str],
    ) -> Result<Record, StoreError> {
        if condition_fields.is_empty() {
            return self.derived_condition(target, message, record).await;
        }
        condition_fields
            .iter()
            .map(|field| {
                record
                    .get(*field)
                    .map(|value| ((*field).to_string(), value.clone()))
                    .ok_or_else(|| {
                        StoreError::conflict_resolution(format!(
                            "condition field {field} is missing from the record"
                        ))
                    })
            })
            .collect()
    }

    async fn derived_condition(
        &self,
        target: &str,
        message: &str,
        record: &Record,
    ) -> Result<Record, StoreError> {
        let condition = self.backend.conflict_key(target, message, record).await?;
        if condition.is_empty() {
            return Err(StoreError::conflict_resolution(format!(
                "no conflict condition derived for {target} from: {message}"
            )));
        }
        Ok(condition)
    }
}

/// A resolution write that touched nothing left the conflicting row as it
/// was.
fn ensure_matched(target: &str, condition: &Record, affected: u64) -> Result<(), StoreError> {
    if affected == 0 {
        return Err(StoreError::conflict_resolution(format!(
            "no row in {target} matched conflict condition {condition:?}"
        )));
    }
    Ok(())
}

enum Resolution {
    Updated,
    Replaced,
    Skipped,
}
