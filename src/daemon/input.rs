//! JSON-lines input records.
//!
//! Each line is one already-matched record addressed to a metric (or, for
//! dumps, to all metrics). Parsing is strict about field value types so
//! that dimension keys stay hashable and totally ordered.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::event::{FieldValue, LogEvent};
use crate::producer::{ConditionKey, DimensionKey, PullDelivery, PullPhase};

/// Errors that can occur while parsing an input line.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("invalid record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("field {field:?}: unsupported {kind} value")]
    UnsupportedValue { field: String, kind: &'static str },

    #[error("field {field:?}: integer {value} out of range")]
    IntegerOutOfRange { field: String, value: u64 },
}

/// A parsed input record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRecord {
    Event {
        metric_id: i64,
        event: LogEvent,
        condition_met: bool,
        condition_key: ConditionKey,
    },
    Condition {
        metric_id: i64,
        condition_met: bool,
        time_ns: u64,
    },
    SlicedCondition {
        metric_id: i64,
        time_ns: u64,
    },
    Pulled {
        metric_id: i64,
        delivery: PullDelivery,
    },
    PullFailed {
        metric_id: i64,
        request_id: u64,
        time_ns: u64,
    },
    Dump {
        time_ns: u64,
    },
}

impl InputRecord {
    /// Addressed metric, or `None` for records that apply to all metrics.
    pub fn metric_id(&self) -> Option<i64> {
        match self {
            Self::Event { metric_id, .. }
            | Self::Condition { metric_id, .. }
            | Self::SlicedCondition { metric_id, .. }
            | Self::Pulled { metric_id, .. }
            | Self::PullFailed { metric_id, .. } => Some(*metric_id),
            Self::Dump { .. } => None,
        }
    }

    /// Timestamp the record carries, used to advance the input clock.
    pub fn time_ns(&self) -> u64 {
        match self {
            Self::Event { event, .. } => event.timestamp_ns,
            Self::Pulled { delivery, .. } => delivery.pull_time_ns,
            Self::Condition { time_ns, .. }
            | Self::SlicedCondition { time_ns, .. }
            | Self::PullFailed { time_ns, .. }
            | Self::Dump { time_ns } => *time_ns,
        }
    }

    /// Short record kind for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event { .. } => "event",
            Self::Condition { .. } => "condition",
            Self::SlicedCondition { .. } => "sliced_condition",
            Self::Pulled { .. } => "pulled",
            Self::PullFailed { .. } => "pull_failed",
            Self::Dump { .. } => "dump",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawRecord {
    Event {
        metric: i64,
        time_ns: u64,
        #[serde(default)]
        fields: Map<String, Value>,
        #[serde(default = "default_true")]
        condition: bool,
        #[serde(default)]
        condition_key: BTreeMap<String, Vec<Value>>,
    },
    Condition {
        metric: i64,
        met: bool,
        time_ns: u64,
    },
    SlicedCondition {
        metric: i64,
        time_ns: u64,
    },
    Pulled {
        metric: i64,
        #[serde(default)]
        request_id: Option<u64>,
        phase: PullPhase,
        time_ns: u64,
        #[serde(default)]
        events: Vec<RawEvent>,
    },
    PullFailed {
        metric: i64,
        request_id: u64,
        time_ns: u64,
    },
    Dump {
        time_ns: u64,
    },
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(default)]
    time_ns: Option<u64>,
    #[serde(default)]
    fields: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// Parse a single input line.
pub fn parse_line(line: &str) -> Result<InputRecord, InputError> {
    let raw: RawRecord = serde_json::from_str(line)?;

    let record = match raw {
        RawRecord::Event {
            metric,
            time_ns,
            fields,
            condition,
            condition_key,
        } => InputRecord::Event {
            metric_id: metric,
            event: to_event(time_ns, fields)?,
            condition_met: condition,
            condition_key: to_condition_key(condition_key)?,
        },
        RawRecord::Condition {
            metric,
            met,
            time_ns,
        } => InputRecord::Condition {
            metric_id: metric,
            condition_met: met,
            time_ns,
        },
        RawRecord::SlicedCondition { metric, time_ns } => InputRecord::SlicedCondition {
            metric_id: metric,
            time_ns,
        },
        RawRecord::Pulled {
            metric,
            request_id,
            phase,
            time_ns,
            events,
        } => InputRecord::Pulled {
            metric_id: metric,
            delivery: PullDelivery {
                request_id,
                phase,
                pull_time_ns: time_ns,
                events: events
                    .into_iter()
                    .map(|e| to_event(e.time_ns.unwrap_or(time_ns), e.fields))
                    .collect::<Result<_, _>>()?,
            },
        },
        RawRecord::PullFailed {
            metric,
            request_id,
            time_ns,
        } => InputRecord::PullFailed {
            metric_id: metric,
            request_id,
            time_ns,
        },
        RawRecord::Dump { time_ns } => InputRecord::Dump { time_ns },
    };

    Ok(record)
}

fn to_event(timestamp_ns: u64, fields: Map<String, Value>) -> Result<LogEvent, InputError> {
    let mut event = LogEvent::new(timestamp_ns);
    for (name, value) in fields {
        let value = to_field_value(&name, value)?;
        event.fields.insert(name, value);
    }
    Ok(event)
}

fn to_condition_key(
    raw: BTreeMap<String, Vec<Value>>,
) -> Result<ConditionKey, InputError> {
    raw.into_iter()
        .map(|(name, values)| {
            let values = values
                .into_iter()
                .map(|v| to_field_value(&name, v))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((name, DimensionKey::new(values)))
        })
        .collect()
}

/// Maps a JSON scalar to a field value. Floats, nulls and containers are
/// rejected.
pub fn to_field_value(field: &str, value: Value) -> Result<FieldValue, InputError> {
    match value {
        Value::Bool(b) => Ok(FieldValue::Bool(b)),
        Value::String(s) => Ok(FieldValue::Str(Arc::from(s))),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(FieldValue::Int(i))
            } else if let Some(u) = n.as_u64() {
                Err(InputError::IntegerOutOfRange {
                    field: field.to_string(),
                    value: u,
                })
            } else {
                Err(unsupported(field, "float"))
            }
        }
        Value::Null => Err(unsupported(field, "null")),
        Value::Array(_) => Err(unsupported(field, "array")),
        Value::Object(_) => Err(unsupported(field, "object")),
    }
}

fn unsupported(field: &str, kind: &'static str) -> InputError {
    InputError::UnsupportedValue {
        field: field.to_string(),
        kind,
    }
}
