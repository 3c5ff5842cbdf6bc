//! Metric producers: per-metric aggregation state machines.
//!
//! A producer owns every piece of per-key state for one metric. Bucketing
//! (`bucket`) and dimension limits (`guardrail`) are standalone parts any
//! producer kind can compose; `value` is the condition-gated, pull-aware
//! value-sum producer.

pub mod anomaly;
pub mod bucket;
pub mod dimension;
pub mod guardrail;
pub mod interval;
pub mod pull;
pub mod report;
pub mod shared;
pub mod stats;
pub mod value;

use std::time::Duration;

use thiserror::Error;

use crate::event::LogEvent;

pub use anomaly::AnomalySink;
pub use bucket::{BucketWindow, ValueBucket};
pub use dimension::{ConditionKey, DimensionKey};
pub use pull::{NoopPullCoordinator, PullCoordinator, PullDelivery, PullPhase, PullRequest};
pub use report::{DumpReport, SliceReport};
pub use shared::{ProducerDiagnostics, SharedProducer};
pub use stats::ProducerStats;
pub use value::ValueMetricProducer;

/// Rejected producer construction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProducerError {
    #[error("metric {metric_id}: invalid bucket size {bucket:?}")]
    InvalidBucket { metric_id: i64, bucket: Duration },

    #[error("metric {metric_id}: value field must not be empty")]
    EmptyValueField { metric_id: i64 },

    #[error("metric {metric_id}: invalid guardrail (soft limit {soft_limit}, hard limit {hard_limit})")]
    InvalidGuardrail {
        metric_id: i64,
        soft_limit: usize,
        hard_limit: usize,
    },
}

/// Entry points shared by every producer kind.
///
/// None of them fail: bad input is dropped and counted, and a broken
/// internal invariant disables only the producer it happened in.
pub trait MetricProducer: Send + Sync {
    fn metric_id(&self) -> i64;

    /// Folds an event already matched to this metric.
    fn on_matched_event(
        &mut self,
        key: DimensionKey,
        condition_key: &ConditionKey,
        condition_met: bool,
        event: &LogEvent,
    );

    /// Condition gate edge notification.
    fn on_condition_changed(&mut self, condition_met: bool, event_time_ns: u64);

    /// Hint that per-slice condition results may have changed.
    fn on_sliced_condition_may_change(&mut self, event_time_ns: u64);

    /// Periodic clock tick; flushes buckets whose end has passed.
    fn on_tick(&mut self, now_ns: u64);

    /// Flushes and drains the bucket history.
    fn on_dump_report(&mut self, dump_time_ns: u64) -> DumpReport;

    /// Estimated memory held by the bucket history.
    fn byte_size(&self) -> usize;
}
