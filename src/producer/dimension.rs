use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::event::{FieldValue, LogEvent};

/// Identifies one slice of a metric.
///
/// Immutable once built. Clones share one allocation, so the interval map
/// and the history map hold the same key storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DimensionKey(Arc<[FieldValue]>);

/// Per-slice condition dimensions supplied by the condition gate.
pub type ConditionKey = BTreeMap<String, DimensionKey>;

impl DimensionKey {
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self(Arc::from(values))
    }

    /// The key of a metric without dimension fields.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Extracts the values of `fields` from `event`, in order.
    /// Absent fields contribute `FieldValue::Missing`.
    pub fn from_event(event: &LogEvent, fields: &[String]) -> Self {
        let values = fields
            .iter()
            .map(|name| event.field(name).cloned().unwrap_or(FieldValue::Missing))
            .collect::<Vec<_>>();
        Self::new(values)
    }

    pub fn values(&self) -> &[FieldValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DimensionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{value}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_dimension_key_as_map_key() {
        let mut map: HashMap<DimensionKey, u32> = HashMap::new();

        let a = DimensionKey::new(vec![FieldValue::from(1000i64), FieldValue::from("pkg")]);
        let b = DimensionKey::new(vec![FieldValue::from(1000i64), FieldValue::from("pkg")]);
        let c = DimensionKey::new(vec![FieldValue::from(1001i64), FieldValue::from("pkg")]);

        *map.entry(a).or_insert(0) += 1;
        *map.entry(b).or_insert(0) += 1;
        *map.entry(c).or_insert(0) += 1;

        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_from_event_uses_configured_field_order() {
        let event = LogEvent::new(0)
            .with_field("uid", 10i64)
            .with_field("state", "fg")
            .with_field("time_ms", 99i64);

        let key = DimensionKey::from_event(&event, &fields(&["state", "uid"]));
        assert_eq!(
            key.values(),
            &[FieldValue::from("fg"), FieldValue::from(10i64)]
        );
    }

    #[test]
    fn test_from_event_missing_field() {
        let event = LogEvent::new(0).with_field("uid", 10i64);

        let key = DimensionKey::from_event(&event, &fields(&["uid", "pkg"]));
        assert_eq!(key.values(), &[FieldValue::from(10i64), FieldValue::Missing]);
        assert_eq!(key.len(), 2);
    }

    #[test]
    fn test_no_dimension_fields_yield_empty_key() {
        let event = LogEvent::new(0).with_field("uid", 10i64);

        let key = DimensionKey::from_event(&event, &[]);
        assert!(key.is_empty());
        assert_eq!(key, DimensionKey::empty());
    }

    #[test]
    fn test_display() {
        let key = DimensionKey::new(vec![FieldValue::from(7i64), FieldValue::from("radio")]);
        assert_eq!(key.to_string(), "(7, radio)");
        assert_eq!(DimensionKey::empty().to_string(), "()");
    }
}
