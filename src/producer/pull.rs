use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::event::LogEvent;

/// Role a pull snapshot plays for the open pull pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPhase {
    /// Opens pairs (condition became true, or a new bucket started).
    Start,
    /// Closes pairs (condition became false).
    End,
    /// Closes the old bucket's pairs and opens the new bucket's.
    Boundary,
}

impl PullPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Boundary => "boundary",
        }
    }
}

/// Request for the external puller to snapshot a counter source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequest {
    pub request_id: u64,
    pub metric_id: i64,
    pub pull_tag: Arc<str>,
    pub phase: PullPhase,
    pub request_time_ns: u64,
    pub bucket_num: u64,
}

/// Snapshot returned by the external puller.
///
/// All events are folded at `pull_time_ns`; their own timestamps are not
/// used. `request_id` is `None` for unsolicited deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullDelivery {
    pub request_id: Option<u64>,
    pub phase: PullPhase,
    pub pull_time_ns: u64,
    pub events: Vec<LogEvent>,
}

/// Outbound side of the pull integration.
///
/// Implementations must not call back into the producer synchronously; the
/// producer's lock is held while requests are issued.
pub trait PullCoordinator: Send + Sync {
    fn request_pull(&self, request: PullRequest);
}

/// Coordinator for push-only metrics. Discards requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPullCoordinator;

impl PullCoordinator for NoopPullCoordinator {
    fn request_pull(&self, _request: PullRequest) {}
}
