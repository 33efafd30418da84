//! The record model shared by the statement builder and every adapter.
//!
//! A [`Record`] is an insertion-ordered map from column or field name to a
//! [`Value`]. Insertion order is the column order used by statement builders.

mod sql_value;
mod value;

pub use sql_value::SqlValue;
pub use value::Value;

pub(crate) use value::{format_date, format_date_time, format_time};

use indexmap::IndexMap;

/// Ordered mapping from column or field name to value.
pub type Record = IndexMap<String, Value>;

/// Builds a [`Record`] from `key => value` pairs, keeping their order.
///
/// # Examples
///
/// ```
/// use dbkit::record;
/// use dbkit::record::Value;
///
/// let row = record! { "id" => 1, "name" => "a" };
/// assert_eq!(row.get_index(0), Some((&"id".to_string(), &Value::Int(1))));
/// ```
#[macro_export]
macro_rules! record {
    () => {
        $crate::record::Record::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut record = $crate::record::Record::new();
        $(
            record.insert(::std::string::String::from($key), $crate::record::Value::from($value));
        )+
        record
    }};
}

/// Converts a record into a JSON object with the same key order.
#[must_use]
pub fn to_json_object(record: &Record) -> serde_json::Map<String, serde_json::Value> {
    record
        .iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    fn macro_preserves_insertion_order() {
        let row = record! { "z" => 1, "a" => "x", "m" => None::<i64> };
        let keys: Vec<&str> = row.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(row["m"], Value::Null);
    }

    #[rstest]
    fn empty_macro_builds_empty_record() {
        let row: Record = record! {};
        assert!(row.is_empty());
    }

    #[rstest]
    fn to_json_object_converts_values() {
        let row = record! { "id" => 1, "tags" => json!(["a"]) };
        let object = to_json_object(&row);
        assert_eq!(serde_json::Value::Object(object), json!({"id": 1, "tags": ["a"]}));
    }

    #[rstest]
    fn record_serializes_like_to_json_object() {
        let row = record! {
            "day" => chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            "n" => None::<i64>,
        };
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            json!({"day": "2024-01-02", "n": null})
        );
    }
}
