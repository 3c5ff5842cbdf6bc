//! Condition-gated, dimension-sliced value metric aggregation.
//!
//! [`producer`] holds the aggregation core; [`daemon`] and [`export`] wrap
//! it into the `tallyd` process.

pub mod clock;
pub mod config;
pub mod daemon;
pub mod event;
pub mod export;
pub mod producer;
