//! Record filters and matching
//!
//! A filter is either an exact-match JSON object or an arbitrary predicate.
//! Exact-match rules:
//!
//! - `name`, `type`, `status` and `registration` compare against the record's
//!   top-level fields.
//! - `location` and `metadata` with an object value match when every entry of
//!   that object is present in the record's map (partial match).
//! - Any other key is looked up in the metadata, then in the location.
//! - The value `"*"` only requires the key to be present.
//! - Values compare as JSON without coercion, so `8080` never equals `"8080"`.

use discovery_types::{JsonObject, Record};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Value matching any present field.
pub const WILDCARD: &str = "*";

type Predicate = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Query filter applied to published records
#[derive(Clone)]
pub enum RecordFilter {
    /// Every key/value pair must match the record
    Exact(JsonObject),
    /// Arbitrary test over the record
    Predicate(Predicate),
}

impl RecordFilter {
    /// Filter matching every record.
    pub fn all() -> Self {
        RecordFilter::Exact(JsonObject::new())
    }

    pub fn exact(fields: JsonObject) -> Self {
        RecordFilter::Exact(fields)
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self::all().and("name", name.into())
    }

    pub fn predicate(f: impl Fn(&Record) -> bool + Send + Sync + 'static) -> Self {
        RecordFilter::Predicate(Arc::new(f))
    }

    /// Add an exact-match constraint.
    ///
    /// On a predicate filter the constraint is combined with the predicate.
    pub fn and(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        match self {
            RecordFilter::Exact(mut fields) => {
                fields.insert(key, value);
                RecordFilter::Exact(fields)
            }
            RecordFilter::Predicate(predicate) => {
                let mut fields = JsonObject::new();
                fields.insert(key, value);
                let extra = RecordFilter::Exact(fields);
                RecordFilter::Predicate(Arc::new(move |record| {
                    predicate(record) && matches(record, &extra)
                }))
            }
        }
    }

    /// Whether the filter constrains `status` itself.
    pub fn constrains_status(&self) -> bool {
        matches!(self, RecordFilter::Exact(fields) if fields.contains_key("status"))
    }
}

impl Default for RecordFilter {
    fn default() -> Self {
        Self::all()
    }
}

impl From<JsonObject> for RecordFilter {
    fn from(fields: JsonObject) -> Self {
        RecordFilter::Exact(fields)
    }
}

impl fmt::Debug for RecordFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordFilter::Exact(fields) => f.debug_tuple("Exact").field(fields).finish(),
            RecordFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl fmt::Display for RecordFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordFilter::Exact(fields) => write!(f, "{}", Value::Object(fields.clone())),
            RecordFilter::Predicate(_) => f.write_str("<predicate>"),
        }
    }
}

/// Test a record against a filter.
pub fn matches(record: &Record, filter: &RecordFilter) -> bool {
    match filter {
        RecordFilter::Predicate(predicate) => predicate(record),
        RecordFilter::Exact(fields) => fields
            .iter()
            .all(|(key, expected)| matches_field(record, key, expected)),
    }
}

fn matches_field(record: &Record, key: &str, expected: &Value) -> bool {
    match key {
        "name" => value_matches(Some(&Value::from(record.name())), expected),
        "type" => value_matches(Some(&Value::from(record.service_type().as_str())), expected),
        "status" => value_matches(Some(&Value::from(record.status().as_str())), expected),
        "registration" => {
            let id = record.id().map(|id| Value::from(id.to_string()));
            value_matches(id.as_ref(), expected)
        }
        "location" if expected.is_object() => object_contains(record.location(), expected),
        "metadata" if expected.is_object() => object_contains(record.metadata(), expected),
        _ => {
            value_matches(record.metadata().get(key), expected)
                || value_matches(record.location().get(key), expected)
        }
    }
}

fn object_contains(actual: &JsonObject, expected: &Value) -> bool {
    match expected {
        Value::Object(subset) => subset
            .iter()
            .all(|(key, value)| value_matches(actual.get(key), value)),
        _ => false,
    }
}

fn value_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => false,
        Some(_) if expected.as_str() == Some(WILDCARD) => true,
        Some(actual) => actual == expected,
    }
}
