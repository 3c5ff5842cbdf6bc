//! Daemon shell around the producers.
//!
//! A reader task parses input lines into a bounded channel. The run loop
//! applies each record to its producer, ticks every producer on a fixed
//! interval, and writes pull requests and reports to the output.

pub mod input;
pub mod output;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::Counter;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{Config, ValueMetricConfig};
use crate::export::health::HealthMetrics;
use crate::producer::{
    AnomalySink, DimensionKey, DumpReport, MetricProducer, ProducerStats, PullCoordinator,
    PullRequest, SharedProducer, ValueBucket, ValueMetricProducer,
};

use self::input::InputRecord;
use self::output::{Output, OutputRecord};

/// Forwards pull requests to the run loop, which writes them out.
#[derive(Debug, Clone)]
pub struct ChannelPullCoordinator {
    tx: mpsc::UnboundedSender<PullRequest>,
}

impl ChannelPullCoordinator {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PullRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PullCoordinator for ChannelPullCoordinator {
    fn request_pull(&self, request: PullRequest) {
        if self.tx.send(request).is_err() {
            warn!("pull request channel closed, dropping request");
        }
    }
}

/// Counts finalized buckets per metric.
struct FlushCounter {
    buckets_flushed: Counter,
}

impl AnomalySink for FlushCounter {
    fn on_bucket_finalized(&self, _key: &DimensionKey, _bucket: &ValueBucket) {
        self.buckets_flushed.inc();
    }
}

/// All configured producers, keyed by metric id.
pub struct ProducerRegistry {
    producers: BTreeMap<i64, SharedProducer>,
    labels: HashMap<i64, String>,
}

impl ProducerRegistry {
    /// Builds one producer per metric, all starting at `origin_ns`.
    pub fn build(
        metrics: &[ValueMetricConfig],
        origin_ns: u64,
        coordinator: Arc<dyn PullCoordinator>,
        health: &HealthMetrics,
    ) -> Result<Self> {
        let mut producers = BTreeMap::new();
        let mut labels = HashMap::with_capacity(metrics.len());

        for cfg in metrics {
            let label = cfg.display_name();
            let mut producer = ValueMetricProducer::new(cfg, origin_ns, Arc::clone(&coordinator))
                .with_context(|| format!("building producer for metric {}", cfg.id))?;
            producer.add_anomaly_sink(Arc::new(FlushCounter {
                buckets_flushed: health.buckets_flushed.with_label_values(&[label.as_str()]),
            }));

            producers.insert(cfg.id, SharedProducer::new(producer));
            labels.insert(cfg.id, label);
        }

        Ok(Self { producers, labels })
    }

    pub fn get(&self, metric_id: i64) -> Option<&SharedProducer> {
        self.producers.get(&metric_id)
    }

    /// Metric label used in health metrics.
    pub fn label(&self, metric_id: i64) -> &str {
        self.labels.get(&metric_id).map_or("unknown", String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SharedProducer> {
        self.producers.values()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    pub fn tick_all(&self, now_ns: u64) {
        for producer in self.producers.values() {
            producer.tick(now_ns);
        }
    }

    /// Dumps every producer, in metric id order.
    pub fn dump_all(&self, dump_time_ns: u64) -> Vec<DumpReport> {
        self.producers
            .values()
            .map(|producer| producer.dump(dump_time_ns))
            .collect()
    }
}

/// Dumps every producer and records the dump in health metrics.
pub fn dump_and_record(
    registry: &ProducerRegistry,
    health: &HealthMetrics,
    dump_time_ns: u64,
) -> Vec<DumpReport> {
    let timer = health.dump_duration.start_timer();
    let reports = registry.dump_all(dump_time_ns);
    timer.observe_duration();

    health.reports_dumped.inc_by(reports.len() as f64);
    debug!(
        dump_time_ns,
        reports = reports.len(),
        buckets = reports.iter().map(DumpReport::bucket_count).sum::<usize>(),
        "dumped all producers",
    );

    reports
}

/// Opens the input stream: stdin for "-", otherwise a file.
pub async fn open_input(path: &str) -> Result<Box<dyn AsyncBufRead + Unpin + Send>> {
    if path == "-" {
        return Ok(Box::new(BufReader::new(tokio::io::stdin())));
    }

    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("opening input file {path}"))?;

    Ok(Box::new(BufReader::new(file)))
}

/// Owns the producers and drives them from the input stream.
pub struct Daemon {
    registry: Arc<ProducerRegistry>,
    clock: Arc<Clock>,
    health: Arc<HealthMetrics>,
    pull_rx: mpsc::UnboundedReceiver<PullRequest>,
    exported_stats: HashMap<i64, ProducerStats>,
    tick_interval: Duration,
    report_interval: Duration,
    channel_capacity: usize,
}

impl Daemon {
    pub fn new(cfg: &Config, health: Arc<HealthMetrics>) -> Result<Self> {
        let clock = Arc::new(Clock::new(cfg.time_source));
        let (coordinator, pull_rx) = ChannelPullCoordinator::channel();
        let registry = ProducerRegistry::build(
            &cfg.metrics,
            clock.origin_ns(),
            Arc::new(coordinator),
            &health,
        )?;

        info!(
            metrics = registry.len(),
            time_source = ?cfg.time_source,
            tick_interval = ?cfg.tick_interval,
            "producers ready",
        );

        Ok(Self {
            registry: Arc::new(registry),
            clock,
            health,
            pull_rx,
            exported_stats: HashMap::new(),
            tick_interval: cfg.tick_interval,
            report_interval: cfg.report.interval,
            channel_capacity: cfg.input.channel_capacity,
        })
    }

    pub fn registry(&self) -> Arc<ProducerRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn clock(&self) -> Arc<Clock> {
        Arc::clone(&self.clock)
    }

    /// Applies one record to its producer. Dump records return the reports.
    pub fn apply(&mut self, record: InputRecord) -> Vec<DumpReport> {
        self.health.records_received.inc();
        self.clock.observe(record.time_ns());

        if let InputRecord::Dump { time_ns } = record {
            return dump_and_record(&self.registry, &self.health, time_ns);
        }

        let Some(producer) = record.metric_id().and_then(|id| self.registry.get(id)) else {
            self.health.unknown_metric_records.inc();
            debug!(
                metric_id = ?record.metric_id(),
                kind = record.kind(),
                "record for unconfigured metric",
            );
            return Vec::new();
        };

        let mut producer = producer.write();
        match record {
            InputRecord::Event {
                event,
                condition_met,
                condition_key,
                ..
            } => {
                let key = producer.dimension_key(&event);
                producer.on_matched_event(key, &condition_key, condition_met, &event);
            }
            InputRecord::Condition {
                condition_met,
                time_ns,
                ..
            } => producer.on_condition_changed(condition_met, time_ns),
            InputRecord::SlicedCondition { time_ns, .. } => {
                producer.on_sliced_condition_may_change(time_ns)
            }
            InputRecord::Pulled { delivery, .. } => producer.on_data_pulled(delivery),
            InputRecord::PullFailed {
                request_id,
                time_ns,
                ..
            } => producer.on_pull_failed(request_id, time_ns),
            InputRecord::Dump { .. } => {}
        }

        Vec::new()
    }

    /// Ticks every producer at the current clock time and refreshes the
    /// per-metric health metrics.
    pub fn tick(&mut self) {
        self.registry.tick_all(self.clock.now_ns());
        self.export_stats();
    }

    /// Pull requests issued since the last call.
    pub fn take_pull_requests(&mut self) -> Vec<PullRequest> {
        let mut requests = Vec::new();
        while let Ok(request) = self.pull_rx.try_recv() {
            requests.push(request);
        }
        requests
    }

    fn export_stats(&mut self) {
        for producer in self.registry.iter() {
            let metric_id = producer.metric_id();
            let label = self.registry.label(metric_id);
            let diagnostics = producer.diagnostics();

            let previous = self.exported_stats.entry(metric_id).or_default();
            let delta = diagnostics.stats.delta_since(previous);
            *previous = diagnostics.stats;

            for (reason, count) in delta.drops() {
                if count > 0 {
                    self.health
                        .events_dropped
                        .with_label_values(&[label, reason])
                        .inc_by(count as f64);
                }
            }
            if delta.tainted_pairs > 0 {
                self.health
                    .tainted_pairs
                    .with_label_values(&[label])
                    .inc_by(delta.tainted_pairs as f64);
            }
            if delta.pulls_failed > 0 {
                self.health
                    .pulls_failed
                    .with_label_values(&[label])
                    .inc_by(delta.pulls_failed as f64);
            }

            self.health
                .dimension_keys
                .with_label_values(&[label])
                .set(diagnostics.dimension_count as f64);
            self.health
                .byte_size
                .with_label_values(&[label])
                .set(diagnostics.byte_size as f64);
            self.health
                .producer_poisoned
                .with_label_values(&[label])
                .set(if diagnostics.poisoned { 1.0 } else { 0.0 });
        }
    }

    async fn write_pull_request(&self, output: &mut Output, request: &PullRequest) -> Result<()> {
        self.health
            .pull_requests
            .with_label_values(&[self.registry.label(request.metric_id), request.phase.as_str()])
            .inc();
        output.write(&OutputRecord::PullRequest(request)).await
    }

    /// Runs until the input ends or `ctx` is cancelled, then dumps every
    /// producer one last time.
    pub async fn run<R>(mut self, reader: R, mut output: Output, ctx: CancellationToken) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let (record_tx, mut record_rx) = mpsc::channel::<InputRecord>(self.channel_capacity);
        let reader_task = tokio::spawn(read_records(
            reader,
            record_tx,
            Arc::clone(&self.health),
            ctx.clone(),
        ));

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut report_ticker = (!self.report_interval.is_zero()).then(|| {
            let mut t = tokio::time::interval_at(
                Instant::now() + self.report_interval,
                self.report_interval,
            );
            t.set_missed_tick_behavior(MissedTickBehavior::Delay);
            t
        });

        info!(
            producers = self.registry.len(),
            output = output.name(),
            report_interval = ?self.report_interval,
            "daemon started",
        );

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("shutdown requested");
                    break;
                }
                record = record_rx.recv() => {
                    let Some(record) = record else {
                        info!("input closed");
                        break;
                    };
                    for report in self.apply(record) {
                        output.write(&OutputRecord::Report(&report)).await?;
                    }
                }
                Some(request) = self.pull_rx.recv() => {
                    self.write_pull_request(&mut output, &request).await?;
                }
                _ = ticker.tick() => {
                    self.health.input_queue_length.set(record_rx.len() as f64);
                    self.tick();
                    output.flush().await?;
                }
                _ = next_tick(&mut report_ticker) => {
                    let now_ns = self.clock.now_ns();
                    for report in dump_and_record(&self.registry, &self.health, now_ns) {
                        output.write(&OutputRecord::Report(&report)).await?;
                    }
                    output.flush().await?;
                }
            }
        }

        reader_task.abort();

        // Drain records already parsed before the final dump.
        while let Ok(record) = record_rx.try_recv() {
            for report in self.apply(record) {
                output.write(&OutputRecord::Report(&report)).await?;
            }
        }

        let now_ns = self.clock.now_ns();
        let reports = dump_and_record(&self.registry, &self.health, now_ns);

        while let Ok(request) = self.pull_rx.try_recv() {
            self.write_pull_request(&mut output, &request).await?;
        }
        for report in &reports {
            output.write(&OutputRecord::Report(report)).await?;
        }
        output.flush().await?;

        self.export_stats();
        info!(reports = reports.len(), "daemon stopped");

        Ok(())
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Reads lines until end of input, cancellation, or the run loop going
/// away. Unparseable lines are counted and skipped.
async fn read_records<R>(
    reader: R,
    tx: mpsc::Sender<InputRecord>,
    health: Arc<HealthMetrics>,
    ctx: CancellationToken,
) where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0u64;

    loop {
        let next = tokio::select! {
            _ = ctx.cancelled() => break,
            next = lines.next_line() => next,
        };

        let line = match next {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(lines = line_no, "input reached end of stream");
                break;
            }
            Err(e) => {
                error!(error = %e, line = line_no, "reading input");
                break;
            }
        };
        line_no += 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match input::parse_line(trimmed) {
            Ok(record) => {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                health.input_parse_errors.inc();
                warn!(line = line_no, error = %e, "skipping unparseable input line");
            }
        }
    }
}
