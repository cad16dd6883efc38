//! Property-based tests for table selection and rendering invariants.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use flowplan::resolution::table_name;
use flowplan::template::{Bindings, render, scan};
use flowplan::{RollupTable, Snapshot};
use proptest::prelude::*;
use std::time::Duration;

const RESOLUTIONS: [u64; 5] = [0, 60, 300, 3600, 86_400];
const TWO_DAYS: i64 = 2 * 86_400;

fn base() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2022, 4, 10, 0, 0, 0).unwrap()
}

fn tables_strategy() -> impl Strategy<Value = Vec<RollupTable>> {
    prop::collection::vec((0..RESOLUTIONS.len(), 0..TWO_DAYS), 0..6).prop_map(|entries| {
        entries
            .into_iter()
            .map(|(idx, offset)| {
                let resolution = Duration::from_secs(RESOLUTIONS[idx]);
                RollupTable::new(
                    table_name(resolution),
                    resolution,
                    base() + ChronoDuration::seconds(offset),
                )
            })
            .collect()
    })
}

fn requested_strategy() -> impl Strategy<Value = Duration> {
    (0u64..7200).prop_map(Duration::from_secs)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2_000))]

    #[test]
    fn bounds_are_aligned_and_not_later(
        tables in tables_strategy(),
        start_offset in 0..TWO_DAYS,
        length in 1..TWO_DAYS,
        requested in requested_strategy(),
    ) {
        let snapshot = Snapshot::new(tables, 1, None);
        let start = base() + ChronoDuration::seconds(start_offset);
        let end = start + ChronoDuration::seconds(length);

        let plan = snapshot.planner().plan(start, end, requested);
        let (rounded_start, rounded_end) = plan.bounds();
        prop_assert!(rounded_start <= start);
        prop_assert!(rounded_end <= end);

        if !plan.resolution().is_zero() {
            let step = i64::try_from(plan.resolution().as_secs()).unwrap();
            prop_assert_eq!(rounded_start.timestamp().rem_euclid(step), 0);
            prop_assert_eq!(rounded_end.timestamp().rem_euclid(step), 0);
            prop_assert!(start - rounded_start < ChronoDuration::seconds(step));
        }

        // Rounding is idempotent: planning the rounded window changes nothing.
        let again = snapshot.planner().plan(rounded_start, rounded_end, requested);
        if again.table() == plan.table() {
            prop_assert_eq!(again.bounds(), plan.bounds());
        }
    }

    #[test]
    fn coarsest_acceptable_covering_table_wins(
        tables in tables_strategy(),
        start_offset in 0..TWO_DAYS,
        requested in requested_strategy(),
    ) {
        let snapshot = Snapshot::new(tables, 1, None);
        let start = base() + ChronoDuration::seconds(start_offset);
        let plan = snapshot.planner().plan(start, start + ChronoDuration::hours(1), requested);

        let best = snapshot
            .tables()
            .iter()
            .filter(|t| t.covers(start) && t.resolution <= requested)
            .map(|t| t.resolution)
            .max();

        if let Some(best) = best {
            let chosen = snapshot.get(plan.table()).unwrap();
            prop_assert!(chosen.covers(start));
            prop_assert_eq!(chosen.resolution, best);
            prop_assert!(!plan.may_be_incomplete());
        }

        if snapshot.tables().iter().any(|t| t.covers(start)) {
            prop_assert!(!plan.is_fallback());
            prop_assert!(!plan.may_be_incomplete());
        }
    }

    #[test]
    fn empty_snapshot_always_falls_back(
        start_offset in 0..TWO_DAYS,
        length in 0..TWO_DAYS,
        requested in requested_strategy(),
    ) {
        let snapshot = Snapshot::default();
        let start = base() + ChronoDuration::seconds(start_offset);
        let end = start + ChronoDuration::seconds(length);

        let plan = snapshot.planner().plan(start, end, requested);
        prop_assert!(plan.is_fallback());
        prop_assert_eq!(plan.table(), "flows");
        prop_assert_eq!(plan.bounds(), (start, end));
        prop_assert_eq!(plan.effective_seconds(), 1);
    }

    #[test]
    fn bucket_width_is_a_multiple_not_above_request(
        width in 0u64..1_000_000,
        resolution_secs in 0u64..100_000,
    ) {
        let bindings = Bindings {
            table: "flows",
            start: base(),
            end: base(),
            resolution_secs,
        };
        let rendered = render(&format!("{{resolution}} {{resolution->{width}}}"), &bindings).unwrap();
        let (step, bucket) = rendered.split_once(' ').unwrap();
        let step: u64 = step.parse().unwrap();
        let bucket: u64 = bucket.parse().unwrap();

        prop_assert_eq!(step, resolution_secs.max(1));
        prop_assert!(bucket <= width);
        prop_assert_eq!(bucket % step, 0);
        prop_assert!(width - bucket < step);
    }

    #[test]
    fn scanning_never_panics(template in "[a-z{}>.\\-0-9 ]{0,64}") {
        // Either scans cleanly or reports a malformed bucket.
        let _ = scan(&template);
    }

    #[test]
    fn text_without_braces_renders_unchanged(template in "[^{}]{0,64}") {
        let bindings = Bindings {
            table: "flows_1m0s",
            start: base(),
            end: base(),
            resolution_secs: 60,
        };
        prop_assert_eq!(render(&template, &bindings).unwrap(), template);
    }
}
