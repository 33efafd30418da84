//! What to do when an insert hits a uniqueness constraint.

use crate::errors::StoreError;
use crate::record::{Record, Value};

/// Conflict policy for [`UpsertExecutor`](super::UpsertExecutor).
#[derive(Debug, Clone, PartialEq)]
pub enum OnConflict {
    /// Surface the duplicate-key error.
    Fail,
    /// Leave the existing row or document untouched.
    Ignore,
    /// Replace the existing row or document with the new one.
    Replace,
    /// Update the named columns of the existing row or document.
    Update(UpdateColumns),
}

impl OnConflict {
    /// Shorthand for [`OnConflict::Update`] reading values from the record.
    #[must_use]
    pub fn update<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Update(UpdateColumns::new(columns))
    }
}

/// Ordered conflict-update columns with optional explicit values.
///
/// # Examples
///
/// ```
/// use dbkit::record;
/// use dbkit::upsert::UpdateColumns;
///
/// let columns = UpdateColumns::new(["name"]);
/// let assignments = columns.assignments(&record! { "id" => 1, "name" => "b" }).unwrap();
/// assert_eq!(assignments, record! { "name" => "b" });
///
/// assert!(UpdateColumns::new(["a", "b"]).with_values([1]).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateColumns {
    columns: Vec<String>,
    values: Option<Vec<Value>>,
}

impl UpdateColumns {
    #[must_use]
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            values: None,
        }
    }

    /// Supplies explicit values matched to the columns by position.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if the lengths differ.
    pub fn with_values<I, V>(mut self, values: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        if values.len() != self.columns.len() {
            return Err(StoreError::validation(format!(
                "{} update values supplied for {} update columns",
                values.len(),
                self.columns.len()
            )));
        }
        self.values = Some(values);
        Ok(self)
    }

    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    #[must_use]
    pub fn values(&self) -> Option<&[Value]> {
        self.values.as_deref()
    }

    /// Resolves the column-to-value assignments applied on conflict.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Validation`] if there are no columns, or if a
    /// column has no explicit value and is missing from `record`.
    pub fn assignments(&self, record: &Record) -> Result<Record, StoreError> {
        if self.columns.is_empty() {
            return Err(StoreError::validation("no update columns given"));
        }
        match &self.values {
            Some(values) => Ok(self
                .columns
                .iter()
                .cloned()
                .zip(values.iter().cloned())
                .collect()),
            None => self
                .columns
                .iter()
                .map(|column| {
                    record
                        .get(column)
                        .map(|value| (column.clone(), value.clone()))
                        .ok_or_else(|| {
                            StoreError::validation(format!(
                                "update column {column} is missing from the record"
                            ))
                        })
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use rstest::rstest;

    #[rstest]
    fn explicit_values_are_positional() {
        let columns = UpdateColumns::new(["a", "b"])
            .with_values([Value::from("x"), Value::Null])
            .unwrap();
        let assignments = columns.assignments(&record! {}).unwrap();
        assert_eq!(assignments, record! { "a" => "x", "b" => None::<i64> });
    }

    #[rstest]
    fn missing_column_is_never_dropped() {
        let error = UpdateColumns::new(["name", "age"])
            .assignments(&record! { "name" => "b" })
            .unwrap_err();
        assert!(error.is_validation());
        assert!(error.to_string().contains("age"));
    }

    #[rstest]
    fn empty_columns_fail() {
        let error = UpdateColumns::new(Vec::<String>::new())
            .assignments(&record! { "a" => 1 })
            .unwrap_err();
        assert!(error.is_validation());
    }

    #[rstest]
    fn update_shorthand_builds_update_policy() {
        assert_eq!(
            OnConflict::update(["name"]),
            OnConflict::Update(UpdateColumns::new(["name"]))
        );
    }
}
