//! Typed field values.
//!
//! Records carry a closed set of value variants instead of arbitrary JSON.
//! The wire form stays JSON: [`FieldValue::decode`] converts an incoming
//! JSON value according to the declared [`FieldType`], and
//! [`FieldValue::to_json`] produces the value sent to the remote.

use crate::{error::Result, schema::FieldType, Error, RecordKey};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A single typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(DateTime<Utc>),
    /// Case name of a declared enum
    Enum(String),
    /// Primary key of a record in another model
    Reference(RecordKey),
}

impl FieldValue {
    /// Name of the variant, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::String(_) => "String",
            FieldValue::Int(_) => "Int",
            FieldValue::Float(_) => "Float",
            FieldValue::Bool(_) => "Bool",
            FieldValue::Date(_) => "Date",
            FieldValue::Enum(_) => "Enum",
            FieldValue::Reference(_) => "Reference",
        }
    }

    /// Check whether this value can be stored in a field of the given type.
    ///
    /// Enum case membership is checked by the registry, not here.
    pub fn matches_type(&self, field_type: &FieldType) -> bool {
        matches!(
            (self, field_type),
            (FieldValue::String(_), FieldType::String)
                | (FieldValue::Int(_), FieldType::Int)
                | (FieldValue::Int(_), FieldType::Float)
                | (FieldValue::Float(_), FieldType::Float)
                | (FieldValue::Bool(_), FieldType::Bool)
                | (FieldValue::Date(_), FieldType::Date)
                | (FieldValue::Enum(_), FieldType::Enum(_))
                | (FieldValue::Reference(_), FieldType::Reference(_))
        )
    }

    /// Decode a wire JSON value into a typed value of `field_type`.
    ///
    /// `Null` decodes to `None`; the caller decides whether that is allowed.
    pub fn decode(
        field: &str,
        field_type: &FieldType,
        value: &serde_json::Value,
    ) -> Result<Option<FieldValue>> {
        use serde_json::Value;

        if value.is_null() {
            return Ok(None);
        }

        let decoded = match (field_type, value) {
            (FieldType::String, Value::String(s)) => FieldValue::String(s.clone()),
            (FieldType::Int, Value::Number(n)) if n.is_i64() => {
                FieldValue::Int(n.as_i64().unwrap_or_default())
            }
            (FieldType::Float, Value::Number(n)) => match n.as_f64() {
                Some(f) => FieldValue::Float(f),
                None => return Err(mismatch(field, field_type, value)),
            },
            (FieldType::Bool, Value::Bool(b)) => FieldValue::Bool(*b),
            (FieldType::Date, Value::String(s)) => {
                let parsed = DateTime::parse_from_rfc3339(s)
                    .map_err(|_| mismatch(field, field_type, value))?;
                FieldValue::Date(parsed.with_timezone(&Utc))
            }
            (FieldType::Enum(_), Value::String(s)) => FieldValue::Enum(s.clone()),
            (FieldType::Reference(_), Value::String(s)) => FieldValue::Reference(s.clone()),
            _ => return Err(mismatch(field, field_type, value)),
        };

        Ok(Some(decoded))
    }

    /// Encode this value in its wire JSON form.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            FieldValue::String(s) | FieldValue::Enum(s) | FieldValue::Reference(s) => {
                serde_json::Value::String(s.clone())
            }
            FieldValue::Int(i) => serde_json::Value::from(*i),
            FieldValue::Float(f) => serde_json::Value::from(*f),
            FieldValue::Bool(b) => serde_json::Value::Bool(*b),
            FieldValue::Date(d) => {
                serde_json::Value::String(d.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
        }
    }

    /// Compare two values of compatible types.
    ///
    /// Returns `None` for values that have no meaningful order between them.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Int(a), FieldValue::Int(b)) => Some(a.cmp(b)),
            (FieldValue::Int(a), FieldValue::Float(b)) => (*a as f64).partial_cmp(b),
            (FieldValue::Float(a), FieldValue::Int(b)) => a.partial_cmp(&(*b as f64)),
            (FieldValue::Float(a), FieldValue::Float(b)) => a.partial_cmp(b),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
            (FieldValue::Date(a), FieldValue::Date(b)) => Some(a.cmp(b)),
            (FieldValue::String(a), FieldValue::String(b))
            | (FieldValue::Enum(a), FieldValue::Enum(b))
            | (FieldValue::Reference(a), FieldValue::Reference(b)) => Some(a.cmp(b)),
            // Keys are plain strings on the wire
            (FieldValue::String(a), FieldValue::Reference(b))
            | (FieldValue::Reference(a), FieldValue::String(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// Borrow the textual content of string-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) | FieldValue::Enum(s) | FieldValue::Reference(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Float(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(value: DateTime<Utc>) -> Self {
        FieldValue::Date(value)
    }
}

fn mismatch(field: &str, expected: &FieldType, got: &serde_json::Value) -> Error {
    Error::TypeMismatch {
        field: field.to_string(),
        expected: expected.to_string(),
        got: json_type_name(got).to_string(),
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}
