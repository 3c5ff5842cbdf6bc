use std::sync::Arc;

use serde::Serialize;

use super::bucket::ValueBucket;
use super::dimension::DimensionKey;

/// History handed to the report sink by a dump. Slices are sorted by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DumpReport {
    pub metric_id: i64,
    pub metric_name: Arc<str>,
    /// Start of the period this report covers.
    pub report_start_ns: u64,
    pub dump_time_ns: u64,
    pub dimension_fields: Arc<[String]>,
    pub slices: Vec<SliceReport>,
}

/// Ordered bucket history of one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceReport {
    pub dimension: DimensionKey,
    pub buckets: Vec<ValueBucket>,
}

impl DumpReport {
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.slices.iter().map(|s| s.buckets.len()).sum()
    }

    pub fn slice(&self, key: &DimensionKey) -> Option<&SliceReport> {
        self.slices
            .binary_search_by(|s| s.dimension.cmp(key))
            .ok()
            .map(|i| &self.slices[i])
    }
}
