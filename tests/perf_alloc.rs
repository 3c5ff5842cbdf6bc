use std::alloc::System;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};
use tallyd::config::{GuardrailConfig, ValueMetricConfig};
use tallyd::daemon::input::parse_line;
use tallyd::event::LogEvent;
use tallyd::producer::{
    ConditionKey, MetricProducer, NoopPullCoordinator, PullDelivery, PullPhase,
    ValueMetricProducer,
};

const SEC: u64 = 1_000_000_000;

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn metric(pull_tag: Option<&str>) -> ValueMetricConfig {
    ValueMetricConfig {
        id: 1,
        name: "alloc-test".to_string(),
        bucket: Duration::from_secs(60),
        pull_tag: pull_tag.map(str::to_string),
        value_field: "value".to_string(),
        dimensions: vec!["uid".to_string()],
        condition: None,
        guardrail: GuardrailConfig::default(),
    }
}

fn producer(pull_tag: Option<&str>) -> ValueMetricProducer {
    ValueMetricProducer::new(&metric(pull_tag), 0, Arc::new(NoopPullCoordinator))
        .expect("valid producer")
}

fn event(time_ns: u64, uid: i64, value: i64) -> LogEvent {
    LogEvent::new(time_ns)
        .with_field("uid", uid)
        .with_field("value", value)
}

#[test]
#[serial]
fn ingest_existing_key_allocates_zero() {
    let mut p = producer(None);
    let e = event(SEC, 10_001, 3);
    let key = p.dimension_key(&e);
    let condition_key = ConditionKey::new();
    p.on_matched_event(key.clone(), &condition_key, true, &e);

    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..4096 {
            p.on_matched_event(key.clone(), &condition_key, true, black_box(&e));
        }
    });

    assert_eq!(p.interval(&key).map(|i| i.sum), Some(3 * 4097));
    assert!(
        allocations <= 4,
        "steady-state ingest allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 4,
        "steady-state ingest deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn pull_delivery_allocation_budget() {
    let mut p = producer(Some("cpu_time"));
    let starts = (0..64).map(|uid| event(0, uid, 10)).collect::<Vec<_>>();
    let ends = (0..64).map(|uid| event(0, uid, 25)).collect::<Vec<_>>();

    let (_, allocations, _deallocations) = measure_alloc_counts(|| {
        p.on_data_pulled(PullDelivery {
            request_id: Some(1),
            phase: PullPhase::Start,
            pull_time_ns: 0,
            events: starts,
        });
        p.on_data_pulled(PullDelivery {
            request_id: None,
            phase: PullPhase::End,
            pull_time_ns: 30 * SEC,
            events: ends,
        });
    });

    assert_eq!(p.dimension_count(), 64);
    // One key per folded event plus map growth.
    assert!(
        allocations <= 192,
        "pull delivery allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn parse_event_line_allocation_budget() {
    let line = r#"{"type":"event","metric":1001,"time_ns":123456789,"fields":{"uid":10001,"value":42}}"#;

    let (_parsed, allocations, deallocations) = measure_alloc_counts(|| {
        let parsed = parse_line(black_box(line)).expect("parse event");
        black_box(&parsed);
    });

    assert!(
        allocations <= 48,
        "event line parse allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 48,
        "event line parse deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn dump_allocation_budget() {
    let mut p = producer(None);
    let condition_key = ConditionKey::new();
    for uid in 0..256 {
        let e = event(SEC, uid, 1);
        p.on_matched_event(p.dimension_key(&e), &condition_key, true, &e);
    }
    let e = event(61 * SEC, 0, 1);
    p.on_matched_event(p.dimension_key(&e), &condition_key, true, &e);
    let e = event(62 * SEC, 1, 1);
    p.on_matched_event(p.dimension_key(&e), &condition_key, true, &e);

    let (report, allocations, _deallocations) = measure_alloc_counts(|| {
        let report = p.on_dump_report(63 * SEC);
        black_box(&report);
        report
    });

    assert_eq!(report.slices.len(), 256);
    assert_eq!(report.bucket_count(), 258);
    // Histories move into the report; only the slice list and the pushes
    // for the two partial-bucket keys allocate.
    assert!(
        allocations <= 8,
        "dump allocation budget exceeded: {}",
        allocations
    );
}
