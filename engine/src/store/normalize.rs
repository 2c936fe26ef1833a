//! Extended-JSON normalization
//!
//! The document store speaks canonical extended JSON. Results are folded
//! back into plain JSON primitives before they leave the store layer, and
//! ISO-8601 date strings in outgoing queries are wrapped as `$date` values.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

/// Fold extended-JSON wrappers into primitives, recursively
///
/// `$oid` and `$date` become strings (dates as RFC 3339), numeric wrappers
/// become numbers. Unknown `$` wrappers are left untouched.
pub fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some((key, inner)) = map.iter().next() {
                    if let Some(primitive) = unwrap_extended(key, inner) {
                        return primitive;
                    }
                }
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, normalize_value(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        other => other,
    }
}

/// Normalize a top-level document
pub fn normalize_document(document: Map<String, Value>) -> Map<String, Value> {
    match normalize_value(Value::Object(document)) {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn unwrap_extended(key: &str, inner: &Value) -> Option<Value> {
    match key {
        "$oid" => inner.as_str().map(|s| Value::String(s.to_string())),
        "$date" => date_to_string(inner).map(Value::String),
        "$numberInt" | "$numberLong" => inner
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::from),
        "$numberDouble" | "$numberDecimal" => inner
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        _ => None,
    }
}

fn date_to_string(inner: &Value) -> Option<String> {
    match inner {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_i64().and_then(millis_to_rfc3339),
        Value::Object(map) => map
            .get("$numberLong")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(millis_to_rfc3339),
        _ => None,
    }
}

fn millis_to_rfc3339(millis: i64) -> Option<String> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Parse an ISO-8601 date or datetime string
///
/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.f]` (taken as UTC) and a
/// bare `YYYY-MM-DD` (midnight UTC).
pub fn parse_iso_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date
            .and_hms_opt(0, 0, 0)
            .map(|naive| Utc.from_utc_datetime(&naive));
    }
    None
}

/// Wrap ISO-8601 strings as extended-JSON dates, recursively
pub fn to_extended_json(value: Value) -> Value {
    match value {
        Value::String(s) => match parse_iso_datetime(&s) {
            Some(dt) => {
                let mut wrapper = Map::new();
                wrapper.insert(
                    "$date".to_string(),
                    Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                );
                Value::Object(wrapper)
            }
            None => Value::String(s),
        },
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, to_extended_json(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(to_extended_json).collect()),
        other => other,
    }
}

/// Type name for one extended-JSON value, used for schema inference
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NoneType",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(map) if map.len() == 1 => match map.keys().next().map(String::as_str) {
            Some("$oid") => "ObjectId",
            Some("$date") => "datetime",
            Some("$numberInt") | Some("$numberLong") => "int",
            Some("$numberDouble") | Some("$numberDecimal") => "float",
            _ => "dict",
        },
        Value::Object(_) => "dict",
    }
}
