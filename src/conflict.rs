//! Deriving the conflicting key from a backend's duplicate-key error text.
//!
//! Both backends report a uniqueness violation as free text. An extractor
//! turns that text, together with the record that was being written, into the
//! key mapping later rendered as an update condition.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::errors::StoreError;
use crate::record::{Record, Value};

/// MongoDB server error code for a duplicate key.
pub const MONGO_DUPLICATE_KEY_CODE: i32 = 11000;

/// MySQL server error number for a duplicate entry.
pub const MYSQL_DUPLICATE_ENTRY_CODE: u16 = 1062;

/// Derives the conflicting key from duplicate-key error text.
pub trait ConflictKeyExtractor {
    /// Returns the key mapping identifying the existing row or document.
    ///
    /// Values are taken from `record` where possible.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::ConflictResolution`] when no non-empty key can be
    /// derived.
    fn extract_conflict_key(&self, message: &str, record: &Record) -> Result<Record, StoreError>;
}

// =============================================================================
// MySQL
// =============================================================================

static DUPLICATE_ENTRY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duplicate entry '(.*)' for key '([^']+)'")
        .expect("Invalid duplicate entry regex pattern")
});

/// Parses `Duplicate entry '<v>' for key '<[table.]key>'`.
///
/// The key name resolves to its columns through `index_columns`, normally
/// loaded from `SHOW INDEX`.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
///
/// use dbkit::conflict::{ConflictKeyExtractor, MySqlDuplicateKey};
/// use dbkit::record;
///
/// let extractor = MySqlDuplicateKey::new(HashMap::from([(
///     "PRIMARY".to_string(),
///     vec!["id".to_string()],
/// )]));
/// let key = extractor
///     .extract_conflict_key(
///         "Duplicate entry '1' for key 'users.PRIMARY'",
///         &record! { "id" => 1, "name" => "b" },
///     )
///     .unwrap();
///
/// assert_eq!(key, record! { "id" => 1 });
/// ```
#[derive(Debug, Clone, Default)]
pub struct MySqlDuplicateKey {
    index_columns: HashMap<String, Vec<String>>,
}

impl MySqlDuplicateKey {
    #[must_use]
    pub const fn new(index_columns: HashMap<String, Vec<String>>) -> Self {
        Self { index_columns }
    }
}

impl ConflictKeyExtractor for MySqlDuplicateKey {
    fn extract_conflict_key(&self, message: &str, record: &Record) -> Result<Record, StoreError> {
        let captures = DUPLICATE_ENTRY_PATTERN.captures(message).ok_or_else(|| {
            StoreError::conflict_resolution(format!("no duplicate entry in: {message}"))
        })?;
        let entry = captures.get(1).map_or("", |capture| capture.as_str());
        let qualified_key = captures.get(2).map_or("", |capture| capture.as_str());
        let key_name = qualified_key
            .rsplit_once('.')
            .map_or(qualified_key, |(_, name)| name);

        let columns = self
            .index_columns
            .get(key_name)
            .filter(|columns| !columns.is_empty())
            .ok_or_else(|| {
                StoreError::conflict_resolution(format!("unknown unique key {key_name}"))
            })?;

        let mut key = Record::new();
        for column in columns {
            let value = match record.get(column) {
                Some(value) => value.clone(),
                None if columns.len() == 1 => Value::Text(entry.to_string()),
                None => {
                    return Err(StoreError::conflict_resolution(format!(
                        "column {column} of key {key_name} is absent from the record"
                    )));
                }
            };
            key.insert(column.clone(), value);
        }
        Ok(key)
    }
}

// =============================================================================
// MongoDB
// =============================================================================

/// Parses the `dup key: { field: value, ... }` part of a MongoDB E11000 error.
///
/// Field values come from the document when present and are otherwise parsed
/// from the text. Servers that omit field names (`{ : 1 }`) yield
/// [`StoreError::ConflictResolution`].
///
/// # Examples
///
/// ```
/// use dbkit::conflict::{ConflictKeyExtractor, MongoDuplicateKey};
/// use dbkit::record;
///
/// let key = MongoDuplicateKey
///     .extract_conflict_key(
///         r#"E11000 duplicate key error collection: db.users index: email_1 dup key: { email: "a@b.c" }"#,
///         &record! { "name" => "x" },
///     )
///     .unwrap();
///
/// assert_eq!(key, record! { "email" => "a@b.c" });
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MongoDuplicateKey;

impl ConflictKeyExtractor for MongoDuplicateKey {
    fn extract_conflict_key(&self, message: &str, record: &Record) -> Result<Record, StoreError> {
        let body = dup_key_body(message).ok_or_else(|| {
            StoreError::conflict_resolution(format!("no dup key in: {message}"))
        })?;

        let mut key = Record::new();
        for entry in split_top_level(body) {
            let Some((name, raw)) = split_field(entry) else {
                continue;
            };
            let name = unquote(name.trim());
            if name.is_empty() {
                return Err(StoreError::conflict_resolution(format!(
                    "dup key lists no field names: {message}"
                )));
            }
            let value = record
                .get(&name)
                .cloned()
                .unwrap_or_else(|| parse_scalar(raw.trim()));
            key.insert(name, value);
        }

        if key.is_empty() {
            return Err(StoreError::conflict_resolution(format!(
                "dup key is empty: {message}"
            )));
        }
        Ok(key)
    }
}

fn dup_key_body(message: &str) -> Option<&str> {
    let start = message.find("dup key:")?;
    let rest = &message[start + "dup key:".len()..];
    let open = rest.find('{')?;
    let close = rest.rfind('}')?;
    (open < close).then(|| &rest[open + 1..close])
}

/// Splits on commas that are outside quotes and nested brackets.
fn split_top_level(body: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0_usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (index, character) in body.char_indices() {
        if let Some(open) = quote {
            if escaped {
                escaped = false;
            } else if character == '\\' {
                escaped = true;
            } else if character == open {
                quote = None;
            }
            continue;
        }
        match character {
            '"' | '\'' => quote = Some(character),
            '{' | '[' | '(' => depth += 1,
            '}' | ']' | ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&body[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    parts.push(&body[start..]);
    parts.into_iter().filter(|part| !part.trim().is_empty()).collect()
}

/// Splits `name: value` at the first colon outside quotes.
fn split_field(entry: &str) -> Option<(&str, &str)> {
    let mut quote: Option<char> = None;
    for (index, character) in entry.char_indices() {
        match (quote, character) {
            (Some(open), current) if current == open => quote = None,
            (None, '"' | '\'') => quote = Some(character),
            (None, ':') => return Some((&entry[..index], &entry[index + 1..])),
            _ => {}
        }
    }
    None
}

fn unquote(text: &str) -> String {
    let stripped = text
        .strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .or_else(|| {
            text.strip_prefix('\'')
                .and_then(|inner| inner.strip_suffix('\''))
        });
    stripped.map_or_else(|| text.to_string(), |inner| inner.replace("\\\"", "\""))
}

fn parse_scalar(raw: &str) -> Value {
    if raw.starts_with('"') || raw.starts_with('\'') {
        return Value::Text(unquote(raw));
    }
    match raw {
        "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => raw
            .parse::<i64>()
            .map(Value::Int)
            .or_else(|_| raw.parse::<f64>().map(Value::Float))
            .unwrap_or_else(|_| Value::Text(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use rstest::rstest;

    // =========================================================================
    // MySQL
    // =========================================================================

    mod mysql {
        use super::*;

        fn extractor() -> MySqlDuplicateKey {
            MySqlDuplicateKey::new(HashMap::from([
                ("PRIMARY".to_string(), vec!["id".to_string()]),
                (
                    "uniq_name_site".to_string(),
                    vec!["name".to_string(), "site".to_string()],
                ),
            ]))
        }

        #[rstest]
        #[case("Duplicate entry '1' for key 'PRIMARY'")]
        #[case("Duplicate entry '1' for key 'users.PRIMARY'")]
        fn primary_key_value_comes_from_record(#[case] message: &str) {
            let key = extractor()
                .extract_conflict_key(message, &record! { "id" => 1, "name" => "b" })
                .unwrap();
            assert_eq!(key, record! { "id" => 1 });
        }

        #[rstest]
        fn single_column_absent_from_record_uses_entry_text() {
            let key = extractor()
                .extract_conflict_key("Duplicate entry '42' for key 'PRIMARY'", &record! {})
                .unwrap();
            assert_eq!(key, record! { "id" => "42" });
        }

        #[rstest]
        fn composite_key_uses_record_values() {
            let key = extractor()
                .extract_conflict_key(
                    "Duplicate entry 'a-x' for key 'uniq_name_site'",
                    &record! { "site" => "x", "name" => "a", "extra" => 1 },
                )
                .unwrap();
            assert_eq!(key, record! { "name" => "a", "site" => "x" });
        }

        #[rstest]
        fn composite_key_with_missing_column_fails() {
            let error = extractor()
                .extract_conflict_key(
                    "Duplicate entry 'a-x' for key 'uniq_name_site'",
                    &record! { "name" => "a" },
                )
                .unwrap_err();
            assert!(error.is_conflict_resolution());
        }

        #[rstest]
        #[case("Duplicate entry '1' for key 'other'")]
        #[case("Deadlock found when trying to get lock")]
        fn unresolvable_message_fails(#[case] message: &str) {
            let error = extractor()
                .extract_conflict_key(message, &record! { "id" => 1 })
                .unwrap_err();
            assert!(error.is_conflict_resolution());
        }
    }

    // =========================================================================
    // MongoDB
    // =========================================================================

    mod mongo {
        use super::*;

        const PREFIX: &str = "E11000 duplicate key error collection: db.items index: ";

        #[rstest]
        fn compound_key_prefers_document_values() {
            let message = format!(r#"{PREFIX}a_1_b_1 dup key: {{ a: 1, b: "x, y" }}"#);
            let key = MongoDuplicateKey
                .extract_conflict_key(&message, &record! { "a" => 1, "c" => 2 })
                .unwrap();
            assert_eq!(key, record! { "a" => 1, "b" => "x, y" });
        }

        #[rstest]
        #[case("1.5", Value::Float(1.5))]
        #[case("true", Value::Bool(true))]
        #[case("null", Value::Null)]
        #[case(r#""q\"uote""#, Value::Text("q\"uote".to_string()))]
        #[case("ObjectId('65a')", Value::Text("ObjectId('65a')".to_string()))]
        fn values_parsed_from_text(#[case] raw: &str, #[case] expected: Value) {
            let message = format!("{PREFIX}f_1 dup key: {{ f: {raw} }}");
            let key = MongoDuplicateKey
                .extract_conflict_key(&message, &record! {})
                .unwrap();
            assert_eq!(key["f"], expected);
        }

        #[rstest]
        fn nameless_dup_key_fails() {
            let message = format!("{PREFIX}f_1 dup key: {{ : 1 }}");
            let error = MongoDuplicateKey
                .extract_conflict_key(&message, &record! { "f" => 1 })
                .unwrap_err();
            assert!(error.is_conflict_resolution());
        }

        #[rstest]
        fn missing_dup_key_fails() {
            let error = MongoDuplicateKey
                .extract_conflict_key("E11000 duplicate key error", &record! {})
                .unwrap_err();
            assert!(error.is_conflict_resolution());
        }

        #[rstest]
        fn quoted_dotted_field_name() {
            let message = format!(r#"{PREFIX}x dup key: {{ "meta.id": 7 }}"#);
            let key = MongoDuplicateKey
                .extract_conflict_key(&message, &record! {})
                .unwrap();
            assert_eq!(key, record! { "meta.id" => 7 });
        }
    }
}
