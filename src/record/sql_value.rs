//! Coercion of record values into SQL scalars.

use super::value::{Value, format_date, format_date_time, format_time};

/// A value reduced to what a SQL literal or bind parameter can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Returns `true` if this is [`SqlValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl Value {
    /// Reduces this value to a [`SqlValue`].
    ///
    /// Text is trimmed, booleans become `0`/`1`, temporal values become their
    /// canonical text, and JSON objects and arrays become compact JSON text.
    ///
    /// # Examples
    ///
    /// ```
    /// use dbkit::record::{SqlValue, Value};
    ///
    /// assert_eq!(Value::Bool(true).coerce(), SqlValue::Integer(1));
    /// assert_eq!(Value::from("  x ").coerce(), SqlValue::Text("x".to_string()));
    /// assert_eq!(Value::Null.coerce(), SqlValue::Null);
    /// ```
    #[must_use]
    pub fn coerce(&self) -> SqlValue {
        match self {
            Self::Null => SqlValue::Null,
            Self::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
            Self::Int(number) => SqlValue::Integer(*number),
            Self::Float(number) => SqlValue::Float(*number),
            Self::Text(text) => SqlValue::Text(text.trim().to_string()),
            Self::Date(date) => SqlValue::Text(format_date(*date)),
            Self::Time(time) => SqlValue::Text(format_time(*time)),
            Self::DateTime(date_time) => SqlValue::Text(format_date_time(*date_time)),
            Self::Json(json) => coerce_json(json),
        }
    }
}

fn coerce_json(json: &serde_json::Value) -> SqlValue {
    match json {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        serde_json::Value::Number(number) => number
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| number.as_f64().map(SqlValue::Float))
            .unwrap_or_else(|| SqlValue::Text(number.to_string())),
        serde_json::Value::String(text) => SqlValue::Text(text.trim().to_string()),
        composite @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => {
            SqlValue::Text(composite.to_string())
        }
    }
}
