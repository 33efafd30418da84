//! Partial-success reporting for batch writes.

use serde::Serialize;

/// How items that could neither be inserted nor resolved are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureReporting {
    /// Count them as skipped.
    #[default]
    Combined,
    /// List each one in [`BatchOutcome::failures`] instead of counting it as
    /// skipped.
    Distinct,
}

/// One item of a batch that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    /// Position of the item in the submitted batch.
    pub index: usize,
    pub message: String,
}

/// Result of a batch write.
///
/// `inserted` is net: `attempted` minus every item that was resolved,
/// skipped or failed.
///
/// # Examples
///
/// ```
/// use dbkit::upsert::BatchOutcome;
///
/// let mut outcome = BatchOutcome::new(10);
/// outcome.updated = 3;
/// outcome.skipped = 1;
/// assert_eq!(outcome.finish().inserted, 6);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub attempted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub replaced: usize,
    pub skipped: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    /// An outcome for `attempted` items with nothing counted yet.
    #[must_use]
    pub fn new(attempted: usize) -> Self {
        Self {
            attempted,
            ..Self::default()
        }
    }

    /// Records a failed item according to `reporting`.
    pub fn record_failure(
        &mut self,
        reporting: FailureReporting,
        index: usize,
        message: impl Into<String>,
    ) {
        match reporting {
            FailureReporting::Combined => self.skipped += 1,
            FailureReporting::Distinct => self.failures.push(BatchFailure {
                index,
                message: message.into(),
            }),
        }
    }

    /// Items resolved by update or replace.
    #[must_use]
    pub const fn resolved(&self) -> usize {
        self.updated + self.replaced
    }

    /// Computes the net `inserted` count from the other counters.
    #[must_use]
    pub fn finish(mut self) -> Self {
        let accounted = self.resolved() + self.skipped + self.failures.len();
        self.inserted = self.attempted.saturating_sub(accounted);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn combined_failures_count_as_skipped() {
        let mut outcome = BatchOutcome::new(4);
        outcome.record_failure(FailureReporting::Combined, 2, "boom");
        let outcome = outcome.finish();
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.inserted, 3);
    }

    #[rstest]
    fn distinct_failures_are_listed() {
        let mut outcome = BatchOutcome::new(4);
        outcome.record_failure(FailureReporting::Distinct, 2, "boom");
        let outcome = outcome.finish();
        assert_eq!(outcome.skipped, 0);
        assert_eq!(
            outcome.failures,
            vec![BatchFailure {
                index: 2,
                message: "boom".to_string()
            }]
        );
        assert_eq!(outcome.inserted, 3);
    }
}
