//! Microbenchmarks for the planning and rendering path.
//!
//! Every dashboard query goes through `plan()` and `render()`, so both must
//! stay cheap next to the ClickHouse round trip.
//!
//! Run with: `cargo bench -p flowplan -- render`

#![allow(missing_docs)]

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use flowplan::resolution::table_name;
use flowplan::{Registry, RollupTable};
use std::time::Duration;

const TRAFFIC: &str = "SELECT toStartOfInterval(TimeReceived, INTERVAL {resolution->864} second) AS t, \
     SUM(Bytes*SamplingRate*8/{resolution}) AS bps FROM {table} WHERE {timefilter} GROUP BY t ORDER BY t";

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 4, 10, 15, 45, 10).unwrap()
}

/// Creates a registry with `count` rollups plus the raw table.
fn setup_registry(count: u64) -> Registry {
    let mut tables = vec![RollupTable::new(
        "flows",
        Duration::ZERO,
        base() - ChronoDuration::days(15),
    )];
    for i in 1..=count {
        let resolution = Duration::from_secs(60 * i);
        tables.push(RollupTable::new(
            table_name(resolution),
            resolution,
            base() - ChronoDuration::days(i64::try_from(i).unwrap_or(i64::MAX) * 7),
        ));
    }
    Registry::with_tables(tables)
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan/table_count");

    for count in [3, 10, 30] {
        let registry = setup_registry(count);
        let start = base() - ChronoDuration::days(30);
        let end = base();

        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| registry.plan(black_box(start), black_box(end), black_box(Duration::from_secs(600))));
        });
    }

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let registry = setup_registry(3);
    let start = base() - ChronoDuration::days(1);
    let end = base();

    c.bench_function("render/traffic_template", |b| {
        b.iter(|| {
            registry
                .render(black_box(TRAFFIC), start, end, Duration::from_secs(300))
                .unwrap()
        });
    });
}

fn bench_render_prepared_plan(c: &mut Criterion) {
    let registry = setup_registry(3);
    let plan = registry.plan(base() - ChronoDuration::days(1), base(), Duration::from_secs(300));

    c.bench_function("render/prepared_plan", |b| {
        b.iter(|| plan.render(black_box(TRAFFIC)).unwrap());
    });
}

criterion_group!(benches, bench_plan, bench_render, bench_render_prepared_plan);
criterion_main!(benches);
