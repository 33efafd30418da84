//! Conversion between records and BSON documents.

use chrono::DateTime;
use mongodb::bson::{self, Bson, Document};

use crate::errors::StoreError;
use crate::record::{Record, Value, format_date, format_time};

/// Converts a value to BSON.
///
/// Dates and times without a date component are stored as text; date-times
/// are stored as BSON UTC date-times.
///
/// # Errors
///
/// Returns [`StoreError::Serialization`] if nested JSON cannot be represented.
pub fn value_to_bson(value: &Value) -> Result<Bson, StoreError> {
    let bson = match value {
        Value::Null => Bson::Null,
        Value::Bool(flag) => Bson::Boolean(*flag),
        Value::Int(number) => Bson::Int64(*number),
        Value::Float(number) => Bson::Double(*number),
        Value::Text(text) => Bson::String(text.clone()),
        Value::Date(date) => Bson::String(format_date(*date)),
        Value::Time(time) => Bson::String(format_time(*time)),
        Value::DateTime(date_time) => Bson::DateTime(bson::DateTime::from_millis(
            date_time.and_utc().timestamp_millis(),
        )),
        Value::Json(json) => bson::to_bson(json)?,
    };
    Ok(bson)
}

/// Converts BSON to a value. Documents, arrays and BSON-specific types become
/// relaxed extended JSON.
#[must_use]
pub fn bson_to_value(bson: Bson) -> Value {
    match bson {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(flag) => Value::Bool(flag),
        Bson::Int32(number) => Value::Int(i64::from(number)),
        Bson::Int64(number) => Value::Int(number),
        Bson::Double(number) => Value::Float(number),
        Bson::String(text) => Value::Text(text),
        Bson::ObjectId(object_id) => Value::Text(object_id.to_hex()),
        Bson::DateTime(date_time) => DateTime::from_timestamp_millis(date_time.timestamp_millis())
            .map_or(Value::Int(date_time.timestamp_millis()), |utc| {
                Value::DateTime(utc.naive_utc())
            }),
        other => Value::Json(other.into_relaxed_extjson()),
    }
}

/// Converts a record to a document, keeping key order.
///
/// # Errors
///
/// See [`value_to_bson`].
pub fn record_to_document(record: &Record) -> Result<Document, StoreError> {
    record
        .iter()
        .map(|(key, value)| Ok((key.clone(), value_to_bson(value)?)))
        .collect()
}

/// Converts a document to a record, keeping key order.
#[must_use]
pub fn document_to_record(document: Document) -> Record {
    document
        .into_iter()
        .map(|(key, value)| (key, bson_to_value(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use chrono::NaiveDate;
    use mongodb::bson::doc;
    use mongodb::bson::oid::ObjectId;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    fn record_to_document_keeps_order_and_types() {
        let record = record! { "b" => 1, "a" => "x", "n" => None::<i64> };
        let document = record_to_document(&record).unwrap();
        assert_eq!(document, doc! { "b": 1_i64, "a": "x", "n": Bson::Null });
        let keys: Vec<&String> = document.keys().collect();
        assert_eq!(keys, ["b", "a", "n"]);
    }

    #[rstest]
    fn nested_json_becomes_subdocument() {
        let record = record! { "meta" => json!({"tags": ["a", "b"]}) };
        let document = record_to_document(&record).unwrap();
        assert_eq!(document, doc! { "meta": { "tags": ["a", "b"] } });
    }

    #[rstest]
    fn date_time_round_trips_through_bson() {
        let date_time = NaiveDate::from_ymd_opt(2024, 5, 6)
            .unwrap()
            .and_hms_milli_opt(7, 8, 9, 10)
            .unwrap();
        let bson = value_to_bson(&Value::DateTime(date_time)).unwrap();
        assert_eq!(bson_to_value(bson), Value::DateTime(date_time));
    }

    #[rstest]
    fn object_id_becomes_hex_text() {
        let object_id = ObjectId::new();
        assert_eq!(
            bson_to_value(Bson::ObjectId(object_id)),
            Value::Text(object_id.to_hex())
        );
    }

    #[rstest]
    fn document_to_record_converts_nested_values() {
        let record = document_to_record(doc! { "n": 3_i32, "sub": { "k": "v" } });
        assert_eq!(record["n"], Value::Int(3));
        assert_eq!(record["sub"], Value::Json(json!({"k": "v"})));
    }
}
