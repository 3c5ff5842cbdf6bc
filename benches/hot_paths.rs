use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use tallyd::config::{GuardrailConfig, ValueMetricConfig};
use tallyd::daemon::input::parse_line;
use tallyd::event::LogEvent;
use tallyd::producer::{
    ConditionKey, MetricProducer, NoopPullCoordinator, PullDelivery, PullPhase,
    ValueMetricProducer,
};

const SEC: u64 = 1_000_000_000;

fn metric(pull_tag: Option<&str>) -> ValueMetricConfig {
    ValueMetricConfig {
        id: 1001,
        name: "bench".to_string(),
        bucket: Duration::from_secs(60),
        pull_tag: pull_tag.map(str::to_string),
        value_field: "value".to_string(),
        dimensions: vec!["uid".to_string(), "state".to_string()],
        condition: None,
        guardrail: GuardrailConfig {
            soft_limit: 4_096,
            hard_limit: 8_192,
        },
    }
}

fn producer(pull_tag: Option<&str>) -> ValueMetricProducer {
    ValueMetricProducer::new(&metric(pull_tag), 0, Arc::new(NoopPullCoordinator))
        .expect("valid producer")
}

fn event(time_ns: u64, uid: i64, value: i64) -> LogEvent {
    LogEvent::new(time_ns)
        .with_field("uid", uid)
        .with_field("state", if uid % 2 == 0 { "fg" } else { "bg" })
        .with_field("value", value)
}

fn snapshot(uids: i64, value: i64) -> Vec<LogEvent> {
    (0..uids).map(|uid| event(0, uid, value + uid)).collect()
}

fn bench_parse_line(c: &mut Criterion) {
    let event_line = r#"{"type":"event","metric":1001,"time_ns":123456789,"fields":{"uid":10001,"state":"fg","value":42}}"#;
    let pulled_line = r#"{"type":"pulled","metric":1001,"request_id":7,"phase":"boundary","time_ns":60000000000,"events":[{"fields":{"uid":1,"value":10}},{"fields":{"uid":2,"value":20}},{"fields":{"uid":3,"value":30}}]}"#;

    c.bench_function("parse_line/event", |b| {
        b.iter(|| parse_line(black_box(event_line)).expect("parse event"))
    });

    c.bench_function("parse_line/pulled_3", |b| {
        b.iter(|| parse_line(black_box(pulled_line)).expect("parse pulled"))
    });
}

fn bench_ingest(c: &mut Criterion) {
    let mut p = producer(None);
    let events = (0..256).map(|uid| event(SEC, uid, 3)).collect::<Vec<_>>();
    let keys = events
        .iter()
        .map(|e| p.dimension_key(e))
        .collect::<Vec<_>>();
    let condition_key = ConditionKey::new();

    c.bench_function("producer/push_256_keys", |b| {
        b.iter(|| {
            for (key, e) in keys.iter().zip(&events) {
                p.on_matched_event(key.clone(), &condition_key, true, black_box(e));
            }
        })
    });
}

fn bench_pull(c: &mut Criterion) {
    let starts = snapshot(256, 1_000);
    let ends = snapshot(256, 1_500);

    c.bench_function("producer/pull_pair_256_keys", |b| {
        b.iter_batched(
            || (producer(Some("cpu_time")), starts.clone(), ends.clone()),
            |(mut p, starts, ends)| {
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
                black_box(p.dimension_count())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_dump(c: &mut Criterion) {
    let condition_key = ConditionKey::new();

    c.bench_function("producer/dump_256_keys_4_buckets", |b| {
        b.iter_batched(
            || {
                let mut p = producer(None);
                for bucket in 0..4u64 {
                    for uid in 0..256 {
                        let e = event(bucket * 60 * SEC + SEC, uid, 1);
                        p.on_matched_event(p.dimension_key(&e), &condition_key, true, &e);
                    }
                }
                p
            },
            |mut p| {
                let report = p.on_dump_report(5 * 60 * SEC);
                black_box(report.bucket_count())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_parse_line(c);
    bench_ingest(c);
    bench_pull(c);
    bench_dump(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
