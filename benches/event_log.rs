//! Performance benchmarks for the hash-chained event log.
//!
//! Run with: `cargo bench --bench event_log`
//!
//! ## Performance Targets
//!
//! | Operation | Target | Notes |
//! |-----------|--------|-------|
//! | Append | <10µs | One SHA-256 plus ring push |
//! | Append at capacity | Same as append | Eviction is O(1) |
//! | Verify 10k events | <20ms | Linear in retained events |
//! | Merge resolve | <50µs | Three nested layers |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use std::sync::Arc;

use masterchef_control::{resolve, EventInput, EventLog, ResolveRequest, SystemClock, VariableLayer};

fn make_input(i: usize) -> EventInput {
    EventInput::new(format!("external.bench.{}", i % 8), "benchmark event")
        .with_field("seq", i as u64)
        .with_field("host", format!("web-{}", i % 32))
}

fn filled_log(capacity: usize, events: usize) -> EventLog {
    let log = EventLog::with_capacity(capacity, 16, Arc::new(SystemClock));
    for i in 0..events {
        log.append(make_input(i));
    }
    log
}

/// Benchmark append on a log with spare capacity.
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(1));

    group.bench_function("with_room", |b| {
        let log = EventLog::with_capacity(10_000_000, 16, Arc::new(SystemClock));
        let mut i = 0usize;
        b.iter(|| {
            i += 1;
            log.append(black_box(make_input(i)))
        })
    });

    group.bench_function("at_capacity", |b| {
        let log = filled_log(1_000, 1_000);
        let mut i = 1_000usize;
        b.iter(|| {
            i += 1;
            log.append(black_box(make_input(i)))
        })
    });

    group.finish();
}

/// Benchmark a full integrity walk.
fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify_integrity");

    for size in [100, 1_000, 10_000] {
        let log = filled_log(size, size);

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("events", size), &log, |b, log| {
            b.iter(|| {
                let report = log.verify_integrity();
                assert!(report.valid);
                report
            })
        });
    }

    group.finish();
}

/// Benchmark layered variable resolution.
fn bench_resolve(c: &mut Criterion) {
    let request = ResolveRequest {
        layers: vec![
            VariableLayer::new(
                "base",
                json!({"service": {"replicas": 2, "image": {"tag": "1.0"}}, "region": "us-east-1"}),
            ),
            VariableLayer::new("env", json!({"service": {"replicas": 4, "limits": {"cpu": "500m"}}})),
            VariableLayer::new("host", json!({"service": {"image": {"tag": "1.1"}}})),
        ],
        lookup: Some("service.image.tag".to_string()),
        ..Default::default()
    };

    c.bench_function("resolve/three_layers", |b| {
        b.iter(|| {
            let resolution = resolve(black_box(&request));
            assert!(resolution.found);
            resolution
        })
    });
}

criterion_group!(benches, bench_append, bench_verify, bench_resolve);
criterion_main!(benches);
