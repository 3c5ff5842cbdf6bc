use super::bucket::ValueBucket;
use super::dimension::DimensionKey;

/// Receives finalized buckets for threshold evaluation.
///
/// Called with the producer's lock held; implementations should be quick
/// and must not call back into the producer.
pub trait AnomalySink: Send + Sync {
    /// Called once per key for every finalized bucket.
    fn on_bucket_finalized(&self, key: &DimensionKey, bucket: &ValueBucket);

    /// Called after each fold with the running value of the current bucket.
    fn detect_in_progress(
        &self,
        _key: &DimensionKey,
        _bucket_num: u64,
        _running_value: i64,
        _event_time_ns: u64,
    ) {
    }
}
