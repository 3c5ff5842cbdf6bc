use std::time::Duration;

use serde::Serialize;

/// Finalized aggregate of one key over one window. Never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ValueBucket {
    pub start_ns: u64,
    pub end_ns: u64,
    pub value: i64,
    pub bucket_num: u64,
}

/// Per-bucket footprint used by the byte-size estimate.
pub const BUCKET_SIZE_BYTES: usize = std::mem::size_of::<ValueBucket>();

/// Aligned bucket cursor.
///
/// Buckets are `[start, start + size)` windows, aligned to the producer's
/// start time. Advancing past idle time skips whole buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketWindow {
    size_ns: u64,
    start_ns: u64,
    num: u64,
}

impl BucketWindow {
    /// Returns `None` for a zero or unrepresentable bucket size.
    pub fn new(start_ns: u64, size: Duration) -> Option<Self> {
        let size_ns = u64::try_from(size.as_nanos()).ok()?;
        if size_ns == 0 {
            return None;
        }

        Some(Self {
            size_ns,
            start_ns,
            num: 0,
        })
    }

    pub fn start_ns(&self) -> u64 {
        self.start_ns
    }

    pub fn end_ns(&self) -> u64 {
        self.start_ns.saturating_add(self.size_ns)
    }

    /// Index of the current bucket, counted from the producer's start.
    pub fn num(&self) -> u64 {
        self.num
    }

    pub fn contains(&self, time_ns: u64) -> bool {
        time_ns >= self.start_ns && time_ns < self.end_ns()
    }

    /// True when `time_ns` is at or beyond the current bucket end.
    pub fn is_past(&self, time_ns: u64) -> bool {
        time_ns >= self.end_ns()
    }

    /// Moves to the aligned bucket containing `time_ns` and returns how many
    /// buckets were advanced.
    ///
    /// Times inside or before the current bucket leave it unchanged and
    /// return 0. Returns `None` if the new bucket or its index is not
    /// representable.
    pub fn advance_to(&mut self, time_ns: u64) -> Option<u64> {
        if time_ns < self.end_ns() {
            return Some(0);
        }

        let forward = (time_ns - self.start_ns) / self.size_ns;
        let start_ns = forward
            .checked_mul(self.size_ns)
            .and_then(|offset| self.start_ns.checked_add(offset))?;
        let end_ns = start_ns.checked_add(self.size_ns)?;
        let num = self.num.checked_add(forward)?;
        if time_ns >= end_ns {
            return None;
        }

        self.start_ns = start_ns;
        self.num = num;
        Some(forward)
    }
}
