use std::sync::Arc;

use parking_lot::{RwLock, RwLockWriteGuard};

use super::report::DumpReport;
use super::stats::ProducerStats;
use super::value::ValueMetricProducer;
use super::MetricProducer;

/// Point-in-time diagnostics read under the shared lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerDiagnostics {
    pub stats: ProducerStats,
    pub dimension_count: usize,
    pub byte_size: usize,
    pub poisoned: bool,
}

/// A producer shared between the ingestion loop, the pull path and the
/// management endpoint.
///
/// Every mutating call takes the write lock, so callers on different tasks
/// are serialized. Diagnostics only take the read lock.
#[derive(Clone)]
pub struct SharedProducer {
    metric_id: i64,
    inner: Arc<RwLock<ValueMetricProducer>>,
}

impl SharedProducer {
    pub fn new(producer: ValueMetricProducer) -> Self {
        Self {
            metric_id: producer.metric_id(),
            inner: Arc::new(RwLock::new(producer)),
        }
    }

    pub fn metric_id(&self) -> i64 {
        self.metric_id
    }

    /// Exclusive access for one or more mutating calls.
    pub fn write(&self) -> RwLockWriteGuard<'_, ValueMetricProducer> {
        self.inner.write()
    }

    pub fn dump(&self, dump_time_ns: u64) -> DumpReport {
        self.inner.write().on_dump_report(dump_time_ns)
    }

    pub fn tick(&self, now_ns: u64) {
        self.inner.write().on_tick(now_ns);
    }

    pub fn diagnostics(&self) -> ProducerDiagnostics {
        let producer = self.inner.read();
        ProducerDiagnostics {
            stats: producer.stats(),
            dimension_count: producer.dimension_count(),
            byte_size: producer.byte_size(),
            poisoned: producer.is_poisoned(),
        }
    }
}
