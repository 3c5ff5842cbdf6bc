use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

/// A typed field value carried by a log event.
///
/// Totally ordered; dimension keys built from it sort deterministically.
/// There is no float variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Missing,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
}

impl FieldValue {
    /// Returns the integer payload, if any.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(Arc::from(v))
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => f.write_str("<missing>"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Str(v) => f.write_str(v),
        }
    }
}

/// An already-matched observation for one metric.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogEvent {
    /// Event time in the boot-time clock domain.
    pub timestamp_ns: u64,
    pub fields: BTreeMap<String, FieldValue>,
}

impl LogEvent {
    pub fn new(timestamp_ns: u64) -> Self {
        Self {
            timestamp_ns,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Reads an integer field. Missing or non-integer fields yield `None`.
    pub fn int_field(&self, name: &str) -> Option<i64> {
        self.fields.get(name).and_then(FieldValue::as_i64)
    }
}
