//! The unit of traffic on the bus.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

/// A single publication on the bus: subject, opaque payload, publisher
/// identity and creation time. Leaves are immutable after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Leaf {
    pub subject: String,
    pub data: Bytes,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Leaf {
    pub fn new(subject: impl Into<String>, data: impl Into<Bytes>, source: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            data: data.into(),
            source: source.into(),
            timestamp: Utc::now(),
        }
    }

    /// Decodes the payload as a JSON object.
    ///
    /// By convention every payload on the bus is a JSON-encoded map; anything
    /// else is rejected so transformers can drop it uniformly.
    pub fn json_map(&self) -> Result<Map<String, Value>, serde_json::Error> {
        match serde_json::from_slice::<Value>(&self.data)? {
            Value::Object(map) => Ok(map),
            other => Err(serde::de::Error::custom(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
