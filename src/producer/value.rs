use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::ValueMetricConfig;
use crate::event::LogEvent;

use super::anomaly::AnomalySink;
use super::bucket::{BucketWindow, ValueBucket, BUCKET_SIZE_BYTES};
use super::dimension::{ConditionKey, DimensionKey};
use super::guardrail::Guardrail;
use super::interval::IntervalState;
use super::pull::{PullCoordinator, PullDelivery, PullPhase, PullRequest};
use super::report::{DumpReport, SliceReport};
use super::stats::ProducerStats;
use super::{MetricProducer, ProducerError};

/// What asked for a boundary check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Tick, condition notification or sliced-condition hint. Waits for an
    /// outstanding pull instead of flushing.
    Control,
    /// Observed data stamped past the boundary.
    Data,
    /// A pull delivery of the given phase.
    Delivery(PullPhase),
    Dump,
}

/// How an observation folds into its interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Add,
    Inferred,
    Start,
    End,
}

/// Condition-gated, dimension-sliced sum of values over aligned buckets.
///
/// Push metrics add raw values. Pull metrics add the difference between
/// the start and end snapshot of each pull pair; pairs missing a half are
/// counted as tainted and contribute nothing.
pub struct ValueMetricProducer {
    metric_id: i64,
    name: Arc<str>,
    pull_tag: Option<Arc<str>>,
    value_field: String,
    dimension_fields: Arc<[String]>,

    condition: bool,
    last_condition_true_ns: Option<u64>,

    window: BucketWindow,
    /// Start of the next record within the current bucket.
    segment_start_ns: u64,
    report_start_ns: u64,

    current: HashMap<DimensionKey, IntervalState>,
    past: HashMap<DimensionKey, Vec<ValueBucket>>,
    past_bucket_count: usize,
    /// Keys in `past` plus keys only in `current`.
    tracked_keys: usize,
    guardrail: Guardrail,

    pull_coordinator: Arc<dyn PullCoordinator>,
    outstanding_pull: Option<PullRequest>,
    /// A start snapshot was coalesced behind the outstanding pull.
    start_pending: bool,
    next_request_id: u64,

    anomaly_sinks: Vec<Arc<dyn AnomalySink>>,
    stats: ProducerStats,
    poisoned: bool,
}

impl std::fmt::Debug for ValueMetricProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueMetricProducer")
            .field("metric_id", &self.metric_id)
            .field("name", &self.name)
            .field("pull_tag", &self.pull_tag)
            .field("window", &self.window)
            .field("condition", &self.condition)
            .field("tracked_keys", &self.tracked_keys)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

impl ValueMetricProducer {
    /// Builds a producer whose first bucket starts at `start_time_ns`.
    ///
    /// Metrics with a condition start with it false. A pulled metric whose
    /// condition starts true requests its first start snapshot right away.
    pub fn new(
        config: &ValueMetricConfig,
        start_time_ns: u64,
        pull_coordinator: Arc<dyn PullCoordinator>,
    ) -> Result<Self, ProducerError> {
        let metric_id = config.id;
        let window = BucketWindow::new(start_time_ns, config.bucket).ok_or(
            ProducerError::InvalidBucket {
                metric_id,
                bucket: config.bucket,
            },
        )?;

        if config.value_field.is_empty() {
            return Err(ProducerError::EmptyValueField { metric_id });
        }

        let limits = config.guardrail;
        if limits.hard_limit == 0 || limits.soft_limit > limits.hard_limit {
            return Err(ProducerError::InvalidGuardrail {
                metric_id,
                soft_limit: limits.soft_limit,
                hard_limit: limits.hard_limit,
            });
        }

        let condition = config.condition.is_none();
        let mut producer = Self {
            metric_id,
            name: Arc::from(config.display_name()),
            pull_tag: config.pull_tag.as_deref().map(Arc::from),
            value_field: config.value_field.clone(),
            dimension_fields: Arc::from(config.dimensions.clone()),
            condition,
            last_condition_true_ns: condition.then_some(start_time_ns),
            window,
            segment_start_ns: start_time_ns,
            report_start_ns: start_time_ns,
            current: HashMap::new(),
            past: HashMap::new(),
            past_bucket_count: 0,
            tracked_keys: 0,
            guardrail: Guardrail::new(metric_id, limits.soft_limit, limits.hard_limit),
            pull_coordinator,
            outstanding_pull: None,
            start_pending: false,
            next_request_id: 0,
            anomaly_sinks: Vec::new(),
            stats: ProducerStats::default(),
            poisoned: false,
        };

        info!(
            metric_id,
            name = %producer.name,
            bucket = ?config.bucket,
            pull_tag = config.pull_tag.as_deref().unwrap_or(""),
            dimensions = ?config.dimensions,
            condition = config.condition.as_deref().unwrap_or(""),
            "value metric producer created",
        );

        if producer.condition {
            producer.request_pull(PullPhase::Start, start_time_ns);
        }

        Ok(producer)
    }

    pub fn add_anomaly_sink(&mut self, sink: Arc<dyn AnomalySink>) {
        self.anomaly_sinks.push(sink);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension_fields(&self) -> &[String] {
        &self.dimension_fields
    }

    /// Extracts this metric's dimension key from an event.
    pub fn dimension_key(&self, event: &LogEvent) -> DimensionKey {
        DimensionKey::from_event(event, &self.dimension_fields)
    }

    pub fn condition(&self) -> bool {
        self.condition
    }

    pub fn last_condition_true_ns(&self) -> Option<u64> {
        self.last_condition_true_ns
    }

    pub fn current_bucket_num(&self) -> u64 {
        self.window.num()
    }

    pub fn current_bucket_start_ns(&self) -> u64 {
        self.window.start_ns()
    }

    pub fn current_bucket_end_ns(&self) -> u64 {
        self.window.end_ns()
    }

    pub fn outstanding_pull(&self) -> Option<&PullRequest> {
        self.outstanding_pull.as_ref()
    }

    /// In-progress state of a key in the current bucket.
    pub fn interval(&self, key: &DimensionKey) -> Option<&IntervalState> {
        self.current.get(key)
    }

    /// Number of distinct keys counted against the guardrail.
    pub fn dimension_count(&self) -> usize {
        self.tracked_keys
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Folds a pull snapshot.
    ///
    /// Events are folded at `pull_time_ns`. A delivery whose `request_id`
    /// matches the outstanding request resolves it, which also releases a
    /// deferred bucket flush.
    pub fn on_data_pulled(&mut self, delivery: PullDelivery) {
        if self.poisoned {
            return;
        }

        let PullDelivery {
            request_id,
            phase,
            pull_time_ns,
            events,
        } = delivery;

        let solicited = matches!(
            (&self.outstanding_pull, request_id),
            (Some(outstanding), Some(id)) if outstanding.request_id == id
        );
        if solicited {
            self.outstanding_pull = None;
        } else {
            debug!(
                metric_id = self.metric_id,
                request_id = ?request_id,
                phase = phase.as_str(),
                "pull delivery does not match the outstanding request",
            );
        }

        let opened_pairs = self.fold_delivery(phase, pull_time_ns, &events);
        if solicited {
            self.issue_pending_start(opened_pairs, pull_time_ns);
        }
    }

    /// Returns true if the delivery opened pull pairs.
    fn fold_delivery(
        &mut self,
        phase: PullPhase,
        pull_time_ns: u64,
        events: &[LogEvent],
    ) -> bool {
        if pull_time_ns < self.window.start_ns() {
            self.stats.stale_events += events.len() as u64;
            debug!(
                metric_id = self.metric_id,
                pull_time_ns,
                bucket_start_ns = self.window.start_ns(),
                events = events.len(),
                "dropping late pull delivery",
            );
            return false;
        }

        match phase {
            PullPhase::Start => {
                if !self.flush_if_needed(pull_time_ns, Trigger::Delivery(phase)) {
                    return false;
                }
                if !self.condition {
                    self.stats.condition_false_events += events.len() as u64;
                    return false;
                }
                self.fold_pulled(events, Role::Start, pull_time_ns);
                true
            }
            PullPhase::End => {
                if !self.flush_if_needed(pull_time_ns, Trigger::Delivery(phase)) {
                    return false;
                }
                self.fold_pulled(events, Role::End, pull_time_ns);
                false
            }
            PullPhase::Boundary => {
                if self.window.is_past(pull_time_ns) {
                    let last_ns = self.window.end_ns() - 1;
                    self.fold_pulled(events, Role::End, last_ns);
                    if !self.flush_if_needed(pull_time_ns, Trigger::Delivery(phase)) {
                        return false;
                    }
                } else {
                    self.fold_pulled(events, Role::End, pull_time_ns);
                }
                if self.condition {
                    self.fold_pulled(events, Role::Start, pull_time_ns);
                }
                self.condition
            }
        }
    }

    /// The coordinator gave up on a request. A deferred flush proceeds with
    /// whatever data arrived.
    pub fn on_pull_failed(&mut self, request_id: u64, time_ns: u64) {
        if self.poisoned {
            return;
        }

        let is_outstanding = self
            .outstanding_pull
            .as_ref()
            .is_some_and(|outstanding| outstanding.request_id == request_id);
        if !is_outstanding {
            debug!(
                metric_id = self.metric_id,
                request_id, "ignoring failure of a pull that is not outstanding",
            );
            return;
        }
        let Some(request) = self.outstanding_pull.take() else {
            return;
        };

        self.stats.pulls_failed += 1;
        warn!(
            metric_id = self.metric_id,
            request_id,
            phase = request.phase.as_str(),
            bucket_num = request.bucket_num,
            "pull failed",
        );

        if time_ns >= self.window.start_ns() {
            self.flush_if_needed(time_ns, Trigger::Data);
        }
        self.issue_pending_start(false, time_ns);
    }

    /// Requests the start snapshot of a rising edge that arrived while
    /// another pull was outstanding. Skipped when the resolved pull already
    /// opened pairs or the condition is false again.
    fn issue_pending_start(&mut self, opened_pairs: bool, request_time_ns: u64) {
        if !std::mem::take(&mut self.start_pending) {
            return;
        }
        if self.poisoned || opened_pairs || !self.condition || self.outstanding_pull.is_some() {
            return;
        }
        self.request_pull(PullPhase::Start, request_time_ns);
    }

    fn fold_pulled(&mut self, events: &[LogEvent], role: Role, time_ns: u64) {
        for event in events {
            let Some(value) = event.int_field(&self.value_field) else {
                self.stats.malformed_events += 1;
                continue;
            };
            let key = DimensionKey::from_event(event, &self.dimension_fields);
            self.fold(key, role, value, time_ns);
        }
    }

    fn fold(&mut self, key: DimensionKey, role: Role, value: i64, event_time_ns: u64) {
        if !self.current.contains_key(&key) && !self.past.contains_key(&key) {
            if !self.guardrail.admit(self.tracked_keys, &key) {
                self.stats.guardrail_drops += 1;
                return;
            }
            self.tracked_keys += 1;
        }

        let interval = self.current.entry(key.clone()).or_default();
        let outcome = match role {
            Role::Add => interval.add(value),
            Role::Inferred => interval.record_inferred(value),
            Role::Start => interval.record_start(value),
            Role::End => interval.record_end(value),
        };
        let running_value = interval.sum;
        self.stats.events_processed += 1;

        if outcome.is_tainted() {
            debug!(
                metric_id = self.metric_id,
                %key,
                ?outcome,
                event_time_ns,
                "pull pair tainted",
            );
        }

        for sink in &self.anomaly_sinks {
            sink.detect_in_progress(&key, self.window.num(), running_value, event_time_ns);
        }
    }

    /// Flushes and advances if `time_ns` is past the current bucket.
    /// Returns false if the producer is poisoned afterwards.
    fn flush_if_needed(&mut self, time_ns: u64, trigger: Trigger) -> bool {
        if !self.window.is_past(time_ns) {
            return true;
        }

        if let Some(outstanding) = &self.outstanding_pull {
            if trigger == Trigger::Control {
                self.stats.deferred_flushes += 1;
                debug!(
                    metric_id = self.metric_id,
                    request_id = outstanding.request_id,
                    time_ns,
                    "deferring bucket flush until outstanding pull resolves",
                );
                return true;
            }

            debug!(
                metric_id = self.metric_id,
                request_id = outstanding.request_id,
                ?trigger,
                "flushing without waiting for outstanding pull",
            );
            self.stats.pulls_abandoned += 1;
            self.outstanding_pull = None;
            self.start_pending = false;
        }

        self.flush_current(self.window.end_ns(), false);

        let Some(forward) = self.window.advance_to(time_ns) else {
            self.poison("bucket arithmetic overflow");
            return false;
        };
        self.segment_start_ns = self.window.start_ns();

        if forward > 1 {
            debug!(
                metric_id = self.metric_id,
                skipped = forward - 1,
                bucket_num = self.window.num(),
                "skipped idle buckets",
            );
        }

        let delivery_opens_pairs = matches!(
            trigger,
            Trigger::Delivery(PullPhase::Start | PullPhase::Boundary)
        );
        if self.condition && !delivery_opens_pairs {
            self.request_pull(PullPhase::Start, time_ns);
        }

        true
    }

    /// Turns every touched interval into a bucket `[segment_start, end_ns)`.
    fn flush_current(&mut self, end_ns: u64, keep_open_starts: bool) {
        let start_ns = self.segment_start_ns;
        let end_ns = end_ns.max(start_ns);
        let bucket_num = self.window.num();
        let mut flushed = 0u64;
        let mut tainted = 0u64;

        for (key, interval) in &self.current {
            if !interval.touched {
                continue;
            }

            let bucket = ValueBucket {
                start_ns,
                end_ns,
                value: interval.sum,
                bucket_num,
            };
            flushed += 1;
            tainted += u64::from(interval.tainted);

            for sink in &self.anomaly_sinks {
                sink.on_bucket_finalized(key, &bucket);
            }
            self.past.entry(key.clone()).or_default().push(bucket);
        }

        if keep_open_starts {
            self.current.retain(|_, interval| {
                interval.reset_keep_start();
                interval.has_open_start()
            });
        } else {
            self.current.clear();
        }

        self.past_bucket_count += flushed as usize;
        self.stats.buckets_flushed += flushed;
        self.stats.tainted_pairs += tainted;
        self.recount_tracked_keys();

        if flushed > 0 {
            debug!(
                metric_id = self.metric_id,
                bucket_num,
                start_ns,
                end_ns,
                keys = flushed,
                tainted,
                "flushed bucket",
            );
        }
    }

    fn recount_tracked_keys(&mut self) {
        let interval_only = self
            .current
            .keys()
            .filter(|key| !self.past.contains_key(*key))
            .count();
        self.tracked_keys = self.past.len() + interval_only;
        self.guardrail.on_keys_released(self.tracked_keys);
    }

    fn request_pull(&mut self, phase: PullPhase, request_time_ns: u64) {
        let Some(pull_tag) = &self.pull_tag else {
            return;
        };

        if let Some(outstanding) = &self.outstanding_pull {
            self.start_pending = phase == PullPhase::Start;
            self.stats.pulls_coalesced += 1;
            debug!(
                metric_id = self.metric_id,
                phase = phase.as_str(),
                outstanding_request_id = outstanding.request_id,
                "pull already outstanding, coalescing request",
            );
            return;
        }

        self.next_request_id += 1;
        let request = PullRequest {
            request_id: self.next_request_id,
            metric_id: self.metric_id,
            pull_tag: Arc::clone(pull_tag),
            phase,
            request_time_ns,
            bucket_num: self.window.num(),
        };

        self.stats.pulls_requested += 1;
        debug!(
            metric_id = self.metric_id,
            request_id = request.request_id,
            phase = phase.as_str(),
            request_time_ns,
            "requesting pull",
        );

        self.pull_coordinator.request_pull(request.clone());
        self.outstanding_pull = Some(request);
    }

    fn poison(&mut self, reason: &'static str) {
        error!(
            metric_id = self.metric_id,
            reason,
            bucket_num = self.window.num(),
            bucket_start_ns = self.window.start_ns(),
            "producer invariant violated, ignoring further input",
        );
        self.poisoned = true;
        self.current.clear();
        self.outstanding_pull = None;
        self.start_pending = false;
        self.recount_tracked_keys();
    }
}

impl MetricProducer for ValueMetricProducer {
    fn metric_id(&self) -> i64 {
        self.metric_id
    }

    fn on_matched_event(
        &mut self,
        key: DimensionKey,
        _condition_key: &ConditionKey,
        condition_met: bool,
        event: &LogEvent,
    ) {
        if self.poisoned {
            return;
        }

        let event_time_ns = event.timestamp_ns;
        if event_time_ns < self.window.start_ns() {
            self.stats.stale_events += 1;
            debug!(
                metric_id = self.metric_id,
                event_time_ns,
                bucket_start_ns = self.window.start_ns(),
                "dropping late event",
            );
            return;
        }

        if !self.flush_if_needed(event_time_ns, Trigger::Data) {
            return;
        }

        if !condition_met {
            self.stats.condition_false_events += 1;
            return;
        }

        let Some(value) = event.int_field(&self.value_field) else {
            self.stats.malformed_events += 1;
            debug!(
                metric_id = self.metric_id,
                value_field = %self.value_field,
                event_time_ns,
                "dropping event without an integer value",
            );
            return;
        };

        let role = if self.pull_tag.is_some() {
            Role::Inferred
        } else {
            Role::Add
        };
        self.fold(key, role, value, event_time_ns);
    }

    fn on_condition_changed(&mut self, condition_met: bool, event_time_ns: u64) {
        if self.poisoned {
            return;
        }

        if event_time_ns < self.window.start_ns() {
            debug!(
                metric_id = self.metric_id,
                condition_met,
                event_time_ns,
                bucket_start_ns = self.window.start_ns(),
                "late condition change, updating state only",
            );
            self.condition = condition_met;
            return;
        }

        if !self.flush_if_needed(event_time_ns, Trigger::Control) {
            return;
        }

        if self.condition == condition_met {
            return;
        }
        self.condition = condition_met;

        debug!(
            metric_id = self.metric_id,
            condition_met,
            event_time_ns,
            "condition changed",
        );

        if condition_met {
            self.last_condition_true_ns = Some(event_time_ns);
            if self.current.is_empty() {
                self.segment_start_ns = event_time_ns;
            }
            self.request_pull(PullPhase::Start, event_time_ns);
        } else if self.pull_tag.is_some() {
            self.request_pull(PullPhase::End, event_time_ns);
        } else {
            self.flush_current(event_time_ns, false);
            self.segment_start_ns = self.segment_start_ns.max(event_time_ns);
        }
    }

    fn on_sliced_condition_may_change(&mut self, event_time_ns: u64) {
        if self.poisoned || event_time_ns < self.window.start_ns() {
            return;
        }

        if !self.flush_if_needed(event_time_ns, Trigger::Control) {
            return;
        }
        debug!(
            metric_id = self.metric_id,
            event_time_ns, "sliced condition may have changed",
        );
    }

    fn on_tick(&mut self, now_ns: u64) {
        if self.poisoned || !self.window.is_past(now_ns) {
            return;
        }

        if self.pull_tag.is_some() && self.condition && self.outstanding_pull.is_none() {
            // The flush happens when the boundary snapshot arrives.
            self.request_pull(PullPhase::Boundary, now_ns);
            return;
        }

        self.flush_if_needed(now_ns, Trigger::Control);
    }

    fn on_dump_report(&mut self, dump_time_ns: u64) -> DumpReport {
        if !self.poisoned {
            if dump_time_ns < self.window.start_ns() {
                debug!(
                    metric_id = self.metric_id,
                    dump_time_ns,
                    bucket_start_ns = self.window.start_ns(),
                    "dump time precedes current bucket, reporting history only",
                );
            } else if self.flush_if_needed(dump_time_ns, Trigger::Dump) {
                self.flush_current(dump_time_ns, true);
                self.segment_start_ns = self.segment_start_ns.max(dump_time_ns);
            }
        }

        let mut slices = self
            .past
            .drain()
            .map(|(dimension, buckets)| SliceReport { dimension, buckets })
            .collect::<Vec<_>>();
        slices.sort_unstable_by(|a, b| a.dimension.cmp(&b.dimension));

        let report_start_ns = self.report_start_ns;
        self.report_start_ns = self.window.start_ns();
        self.past_bucket_count = 0;
        self.recount_tracked_keys();
        self.stats.dumps += 1;

        debug!(
            metric_id = self.metric_id,
            dump_time_ns,
            slices = slices.len(),
            "dumped report",
        );

        DumpReport {
            metric_id: self.metric_id,
            metric_name: Arc::clone(&self.name),
            report_start_ns,
            dump_time_ns,
            dimension_fields: Arc::clone(&self.dimension_fields),
            slices,
        }
    }

    fn byte_size(&self) -> usize {
        self.past_bucket_count * BUCKET_SIZE_BYTES
    }
}
