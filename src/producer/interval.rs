/// Result of folding one observation into an interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fold {
    /// A raw value was added (push metrics).
    Added,
    /// A pull pair was opened.
    Started,
    /// A pull pair was closed and its diff added.
    Completed,
    /// A start arrived while one was already open; the old start was
    /// replaced and the interval tainted.
    StartReplaced,
    /// An end arrived without an open start; the interval was tainted.
    UnmatchedEnd,
}

impl Fold {
    pub fn is_tainted(self) -> bool {
        matches!(self, Self::StartReplaced | Self::UnmatchedEnd)
    }
}

/// Per-key accumulator for the current bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalState {
    pub start_value: Option<i64>,
    pub start_updated: bool,
    pub tainted: u32,
    pub sum: i64,
    /// Observed at least once since the last flush.
    pub touched: bool,
}

impl IntervalState {
    pub fn add(&mut self, value: i64) -> Fold {
        self.sum = self.sum.saturating_add(value);
        self.touched = true;
        Fold::Added
    }

    /// Opens a pull pair. Replaces (and taints) an already-open start.
    pub fn record_start(&mut self, value: i64) -> Fold {
        let outcome = if self.start_updated {
            self.tainted = self.tainted.saturating_add(1);
            Fold::StartReplaced
        } else {
            Fold::Started
        };
        self.start_value = Some(value);
        self.start_updated = true;
        self.touched = true;
        outcome
    }

    /// Closes the open pull pair, adding `end - start` to the sum.
    pub fn record_end(&mut self, value: i64) -> Fold {
        self.touched = true;
        match self.start_value {
            Some(start) if self.start_updated => {
                self.sum = self.sum.saturating_add(value.saturating_sub(start));
                self.start_updated = false;
                Fold::Completed
            }
            _ => {
                self.tainted = self.tainted.saturating_add(1);
                Fold::UnmatchedEnd
            }
        }
    }

    /// Folds a pulled observation whose role is not stated.
    ///
    /// With an open start it is the end; on an untouched key it is the
    /// start; otherwise it is an end without a start.
    pub fn record_inferred(&mut self, value: i64) -> Fold {
        if self.start_updated || self.touched {
            self.record_end(value)
        } else {
            self.record_start(value)
        }
    }

    pub fn has_open_start(&self) -> bool {
        self.start_updated
    }

    /// Clears the per-bucket accumulation but keeps an open start so an
    /// in-flight pair can still complete.
    pub fn reset_keep_start(&mut self) {
        self.sum = 0;
        self.tainted = 0;
        self.touched = false;
        if !self.start_updated {
            self.start_value = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_values_accumulate() {
        let mut s = IntervalState::default();
        assert_eq!(s.add(3), Fold::Added);
        assert_eq!(s.add(4), Fold::Added);
        assert_eq!(s.sum, 7);
        assert!(s.touched);
    }

    #[test]
    fn test_matched_pair_adds_diff() {
        let mut s = IntervalState::default();
        assert_eq!(s.record_start(10), Fold::Started);
        assert_eq!(s.record_end(25), Fold::Completed);
        assert_eq!(s.sum, 15);
        assert_eq!(s.tainted, 0);
        assert!(!s.has_open_start());
    }

    #[test]
    fn test_consecutive_pairs_sum_diffs() {
        let mut s = IntervalState::default();
        s.record_start(10);
        s.record_end(25);
        s.record_start(100);
        s.record_end(101);
        assert_eq!(s.sum, 16);
    }

    #[test]
    fn test_end_without_start_taints() {
        let mut s = IntervalState::default();
        assert_eq!(s.record_end(25), Fold::UnmatchedEnd);
        assert_eq!(s.sum, 0);
        assert_eq!(s.tainted, 1);
        assert!(s.touched);
    }

    #[test]
    fn test_duplicate_start_taints_and_overwrites() {
        let mut s = IntervalState::default();
        s.record_start(10);
        assert_eq!(s.record_start(20), Fold::StartReplaced);
        assert_eq!(s.tainted, 1);
        assert_eq!(s.record_end(26), Fold::Completed);
        assert_eq!(s.sum, 6);
    }

    #[test]
    fn test_inferred_roles() {
        let mut s = IntervalState::default();
        assert_eq!(s.record_inferred(10), Fold::Started);
        assert_eq!(s.record_inferred(25), Fold::Completed);
        // Touched with no open start: an end without a start.
        assert_eq!(s.record_inferred(30), Fold::UnmatchedEnd);
        assert_eq!(s.sum, 15);
        assert_eq!(s.tainted, 1);
    }

    #[test]
    fn test_inferred_end_after_kept_start() {
        let mut s = IntervalState::default();
        s.record_start(10);
        s.reset_keep_start();
        assert!(!s.touched);
        assert_eq!(s.record_inferred(18), Fold::Completed);
        assert_eq!(s.sum, 8);
    }

    #[test]
    fn test_reset_keep_start() {
        let mut s = IntervalState::default();
        s.record_start(1);
        s.record_end(5);
        s.record_end(9);
        s.record_start(40);
        s.reset_keep_start();

        assert_eq!(s.sum, 0);
        assert_eq!(s.tainted, 0);
        assert!(!s.touched);
        assert_eq!(s.start_value, Some(40));
        assert!(s.has_open_start());
    }

    #[test]
    fn test_sum_saturates() {
        let mut s = IntervalState::default();
        s.add(i64::MAX);
        s.add(1);
        assert_eq!(s.sum, i64::MAX);
    }
}
