/// Cumulative producer counters.
///
/// Updated under the producer's lock. Exporters keep the previous value
/// and publish `delta_since` so the counters can feed monotonic metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    /// Observations folded into interval state.
    pub events_processed: u64,
    /// Events older than the current bucket start.
    pub stale_events: u64,
    /// Events ignored because the condition was false.
    pub condition_false_events: u64,
    /// Events with a missing or non-integer value field.
    pub malformed_events: u64,
    /// Events dropped because their key exceeded the guardrail.
    pub guardrail_drops: u64,
    /// Pull pairs with a missing or duplicated half, counted at flush.
    pub tainted_pairs: u64,
    pub buckets_flushed: u64,
    pub pulls_requested: u64,
    /// Requests raised while another pull was outstanding.
    pub pulls_coalesced: u64,
    pub pulls_failed: u64,
    /// Outstanding pulls given up on by a forced flush.
    pub pulls_abandoned: u64,
    /// Boundary flushes postponed for an outstanding pull.
    pub deferred_flushes: u64,
    pub dumps: u64,
}

impl ProducerStats {
    /// Per-counter difference to an earlier snapshot.
    pub fn delta_since(&self, earlier: &ProducerStats) -> ProducerStats {
        ProducerStats {
            events_processed: self.events_processed.saturating_sub(earlier.events_processed),
            stale_events: self.stale_events.saturating_sub(earlier.stale_events),
            condition_false_events: self
                .condition_false_events
                .saturating_sub(earlier.condition_false_events),
            malformed_events: self.malformed_events.saturating_sub(earlier.malformed_events),
            guardrail_drops: self.guardrail_drops.saturating_sub(earlier.guardrail_drops),
            tainted_pairs: self.tainted_pairs.saturating_sub(earlier.tainted_pairs),
            buckets_flushed: self.buckets_flushed.saturating_sub(earlier.buckets_flushed),
            pulls_requested: self.pulls_requested.saturating_sub(earlier.pulls_requested),
            pulls_coalesced: self.pulls_coalesced.saturating_sub(earlier.pulls_coalesced),
            pulls_failed: self.pulls_failed.saturating_sub(earlier.pulls_failed),
            pulls_abandoned: self.pulls_abandoned.saturating_sub(earlier.pulls_abandoned),
            deferred_flushes: self.deferred_flushes.saturating_sub(earlier.deferred_flushes),
            dumps: self.dumps.saturating_sub(earlier.dumps),
        }
    }

    /// Dropped-event counters as `(reason, count)` pairs.
    pub fn drops(&self) -> [(&'static str, u64); 4] {
        [
            ("stale", self.stale_events),
            ("condition_false", self.condition_false_events),
            ("malformed", self.malformed_events),
            ("guardrail", self.guardrail_drops),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_since() {
        let earlier = ProducerStats {
            events_processed: 10,
            stale_events: 1,
            dumps: 2,
            ..Default::default()
        };
        let later = ProducerStats {
            events_processed: 25,
            stale_events: 1,
            guardrail_drops: 4,
            dumps: 3,
            ..Default::default()
        };

        let delta = later.delta_since(&earlier);
        assert_eq!(delta.events_processed, 15);
        assert_eq!(delta.stale_events, 0);
        assert_eq!(delta.guardrail_drops, 4);
        assert_eq!(delta.dumps, 1);
    }

    #[test]
    fn test_drops_reasons() {
        let stats = ProducerStats {
            malformed_events: 3,
            guardrail_drops: 1,
            ..Default::default()
        };

        let drops = stats.drops();
        assert_eq!(drops[2], ("malformed", 3));
        assert_eq!(drops[3], ("guardrail", 1));
    }
}
