use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::daemon::{dump_and_record, ProducerRegistry};

const NAMESPACE: &str = "tallyd";

/// Prometheus metrics for daemon health and observability.
///
/// All metrics use the "tallyd" namespace. Per-metric series are labelled
/// with the metric name.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total input records applied.
    pub records_received: Counter,
    /// Input lines that failed to parse.
    pub input_parse_errors: Counter,
    /// Records addressed to a metric that is not configured.
    pub unknown_metric_records: Counter,
    /// Records parsed but not yet applied.
    pub input_queue_length: Gauge,
    /// Events dropped by metric and reason.
    pub events_dropped: CounterVec,
    /// Pull pairs missing a half, by metric.
    pub tainted_pairs: CounterVec,
    /// Finalized buckets by metric.
    pub buckets_flushed: CounterVec,
    /// Pull requests issued by metric and phase.
    pub pull_requests: CounterVec,
    /// Pulls reported failed by the puller, by metric.
    pub pulls_failed: CounterVec,
    /// Reports produced by dumps.
    pub reports_dumped: Counter,
    /// Distinct tracked dimension keys by metric.
    pub dimension_keys: GaugeVec,
    /// Estimated bucket history size by metric.
    pub byte_size: GaugeVec,
    /// Whether a producer is disabled by an invariant violation (1=yes, 0=no).
    pub producer_poisoned: GaugeVec,
    /// Time to dump every producer.
    pub dump_duration: Histogram,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let records_received = Counter::with_opts(opts(
            "records_received_total",
            "Total input records applied to producers.",
        ))?;
        let input_parse_errors = Counter::with_opts(opts(
            "input_parse_errors_total",
            "Total input lines that failed to parse.",
        ))?;
        let unknown_metric_records = Counter::with_opts(opts(
            "unknown_metric_records_total",
            "Total records addressed to an unconfigured metric.",
        ))?;
        let input_queue_length = Gauge::with_opts(opts(
            "input_queue_length",
            "Parsed records waiting to be applied.",
        ))?;
        let events_dropped = CounterVec::new(
            opts(
                "events_dropped_total",
                "Total events dropped by metric and reason.",
            ),
            &["metric", "reason"],
        )?;
        let tainted_pairs = CounterVec::new(
            opts(
                "tainted_pairs_total",
                "Total pull pairs with a missing or duplicated half.",
            ),
            &["metric"],
        )?;
        let buckets_flushed = CounterVec::new(
            opts("buckets_flushed_total", "Total finalized buckets by metric."),
            &["metric"],
        )?;
        let pull_requests = CounterVec::new(
            opts(
                "pull_requests_total",
                "Total pull requests issued by metric and phase.",
            ),
            &["metric", "phase"],
        )?;
        let pulls_failed = CounterVec::new(
            opts("pulls_failed_total", "Total failed pulls by metric."),
            &["metric"],
        )?;
        let reports_dumped = Counter::with_opts(opts(
            "reports_dumped_total",
            "Total metric reports produced by dumps.",
        ))?;
        let dimension_keys = GaugeVec::new(
            opts(
                "dimension_keys",
                "Distinct dimension keys tracked by metric.",
            ),
            &["metric"],
        )?;
        let byte_size = GaugeVec::new(
            opts(
                "byte_size_bytes",
                "Estimated bucket history size by metric.",
            ),
            &["metric"],
        )?;
        let producer_poisoned = GaugeVec::new(
            opts(
                "producer_poisoned",
                "Whether the metric's producer is disabled (1=yes, 0=no).",
            ),
            &["metric"],
        )?;
        let dump_duration = Histogram::with_opts(
            HistogramOpts::new("dump_duration_seconds", "Time to dump every producer.")
                .namespace(NAMESPACE)
                .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1]),
        )?;

        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(input_parse_errors.clone()))?;
        registry.register(Box::new(unknown_metric_records.clone()))?;
        registry.register(Box::new(input_queue_length.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(tainted_pairs.clone()))?;
        registry.register(Box::new(buckets_flushed.clone()))?;
        registry.register(Box::new(pull_requests.clone()))?;
        registry.register(Box::new(pulls_failed.clone()))?;
        registry.register(Box::new(reports_dumped.clone()))?;
        registry.register(Box::new(dimension_keys.clone()))?;
        registry.register(Box::new(byte_size.clone()))?;
        registry.register(Box::new(producer_poisoned.clone()))?;
        registry.register(Box::new(dump_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_received,
            input_parse_errors,
            unknown_metric_records,
            input_queue_length,
            events_dropped,
            tainted_pairs,
            buckets_flushed,
            pull_requests,
            pulls_failed,
            reports_dumped,
            dimension_keys,
            byte_size,
            producer_poisoned,
            dump_duration,
        })
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
    }

    /// Starts the HTTP server serving /metrics, /healthz and /dump.
    /// Returns the bound address.
    pub async fn start(
        self: &Arc<Self>,
        producers: Arc<ProducerRegistry>,
        clock: Arc<Clock>,
    ) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            health: Arc::clone(self),
            producers,
            clock,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/dump", post(dump_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    health: Arc<HealthMetrics>,
    producers: Arc<ProducerRegistry>,
    clock: Arc<Clock>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.health.render() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// POST /dump - Dumps every producer at the current clock time and returns
/// the reports. The dumped history is gone afterwards.
async fn dump_handler(State(state): State<Arc<AppState>>) -> Response {
    let now_ns = state.clock.now_ns();
    let reports = dump_and_record(&state.producers, &state.health, now_ns);
    tracing::info!(dump_time_ns = now_ns, reports = reports.len(), "dump requested over http");

    Json(reports).into_response()
}
