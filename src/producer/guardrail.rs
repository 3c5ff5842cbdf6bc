use tracing::warn;

use super::dimension::DimensionKey;

/// Default tracked-key count at which a warning is logged.
pub const DEFAULT_SOFT_LIMIT: usize = 300;
/// Default maximum number of tracked keys per metric.
pub const DEFAULT_HARD_LIMIT: usize = 500;

/// Caps the number of distinct dimension keys a producer tracks.
#[derive(Debug)]
pub struct Guardrail {
    metric_id: i64,
    soft_limit: usize,
    hard_limit: usize,
    soft_limit_reached: bool,
    dropped: u64,
}

impl Guardrail {
    pub fn new(metric_id: i64, soft_limit: usize, hard_limit: usize) -> Self {
        Self {
            metric_id,
            soft_limit,
            hard_limit,
            soft_limit_reached: false,
            dropped: 0,
        }
    }

    /// Decides whether a key not yet tracked may be added, given the number
    /// of keys already tracked.
    pub fn admit(&mut self, tracked: usize, key: &DimensionKey) -> bool {
        if tracked >= self.soft_limit && !self.soft_limit_reached {
            self.soft_limit_reached = true;
            warn!(
                metric_id = self.metric_id,
                tracked,
                soft_limit = self.soft_limit,
                hard_limit = self.hard_limit,
                "dimension count reached soft limit",
            );
        }

        if tracked >= self.hard_limit {
            self.dropped += 1;
            // First drop, then every 1024th.
            if self.dropped & 1023 == 1 {
                warn!(
                    metric_id = self.metric_id,
                    %key,
                    hard_limit = self.hard_limit,
                    dropped = self.dropped,
                    "dimension hard limit reached, dropping new key",
                );
            }
            return false;
        }

        true
    }

    /// Re-arms the soft-limit warning once the tracked count falls back
    /// below it.
    pub fn on_keys_released(&mut self, tracked: usize) {
        if tracked < self.soft_limit {
            self.soft_limit_reached = false;
        }
    }
}
