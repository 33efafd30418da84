//! Options controlling the shape of insert statements.

use crate::record::Value;

/// The conflict behavior an insert statement is rendered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// `insert [ignore] into ...`
    Plain,
    /// `replace into ...`
    ReplaceAll,
    /// `insert [ignore] into ... on duplicate key update ...`
    UpdateColumns,
}

/// Options for [`build_insert`](super::build_insert) and
/// [`build_batch_insert`](super::build_batch_insert).
///
/// Setting conflict-update columns forces [`InsertMode::UpdateColumns`] even
/// when [`replace_all`](Self::replace_all) was requested.
///
/// # Examples
///
/// ```
/// use dbkit::sql::{InsertMode, InsertOptions};
///
/// let options = InsertOptions::new().replace_all().update_columns(["name"]);
/// assert_eq!(options.mode(), InsertMode::UpdateColumns);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InsertOptions {
    replace_all: bool,
    update_columns: Vec<String>,
    update_values: Option<Vec<Value>>,
    ignore_duplicates: Option<bool>,
}

impl InsertOptions {
    /// Plain insert options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests `replace into` on conflict.
    #[must_use]
    pub fn replace_all(mut self) -> Self {
        self.replace_all = true;
        self
    }

    /// Sets the columns updated on conflict.
    #[must_use]
    pub fn update_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets explicit values for the conflict-update columns, matched by position.
    #[must_use]
    pub fn update_values<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.update_values = Some(values.into_iter().map(Into::into).collect());
        self
    }

    /// Chooses whether duplicates are silently ignored (`insert ignore`).
    #[must_use]
    pub const fn ignore_duplicates(mut self, ignore: bool) -> Self {
        self.ignore_duplicates = Some(ignore);
        self
    }

    /// The effective mode after applying the column-forcing rule.
    #[must_use]
    pub fn mode(&self) -> InsertMode {
        if !self.update_columns.is_empty() {
            InsertMode::UpdateColumns
        } else if self.replace_all {
            InsertMode::ReplaceAll
        } else {
            InsertMode::Plain
        }
    }

    /// Columns updated on conflict.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.update_columns
    }

    /// Explicit conflict values, if any.
    #[must_use]
    pub fn values(&self) -> Option<&[Value]> {
        self.update_values.as_deref()
    }

    /// The explicit ignore choice, if the caller made one.
    #[must_use]
    pub const fn ignore_choice(&self) -> Option<bool> {
        self.ignore_duplicates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn default_is_plain_without_ignore_choice() {
        let options = InsertOptions::new();
        assert_eq!(options.mode(), InsertMode::Plain);
        assert_eq!(options.ignore_choice(), None);
        assert!(options.values().is_none());
    }

    #[rstest]
    fn replace_all_without_columns_is_replace() {
        assert_eq!(InsertOptions::new().replace_all().mode(), InsertMode::ReplaceAll);
    }

    #[rstest]
    fn update_values_are_converted() {
        let options = InsertOptions::new()
            .update_columns(["a", "b"])
            .update_values([Value::from(1), Value::from("x")]);
        assert_eq!(options.columns(), ["a".to_string(), "b".to_string()]);
        assert_eq!(options.values().map(<[Value]>::len), Some(2));
    }
}
