//! Table selection and query rendering.
//!
//! The planner answers one question: given a time window and the coarsest
//! resolution the caller can accept, which flow table should serve the query?
//! It works on a borrowed table list (usually a registry [`Snapshot`]) and
//! never mutates it, so any number of planners can run concurrently with a
//! refresh.
//!
//! # Selection
//!
//! A table *covers* a request when its oldest retained row is not after the
//! requested start.
//!
//! 1. Among covering tables no coarser than requested, pick the coarsest.
//! 2. If every covering table is too coarse, pick the finest covering one:
//!    full range wins over precision.
//! 3. If nothing covers, pick among tables no coarser than requested the one
//!    reaching furthest back.
//! 4. Equal candidates prefer the raw table, then the smallest name.
//!
//! When no table qualifies (including an empty snapshot), the plan targets
//! the raw table name with the bounds left untouched.
//!
//! # Rounding
//!
//! Bounds are floored to the selected table's resolution so the filter lines
//! up with bucket boundaries.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use chrono::{TimeZone, Utc};
//! use flowplan::planner::Planner;
//! use flowplan::table::RollupTable;
//!
//! let tables = vec![
//!     RollupTable::new("flows", Duration::ZERO, Utc.with_ymd_and_hms(2022, 3, 10, 0, 0, 0).unwrap()),
//!     RollupTable::new("flows_1m0s", Duration::from_secs(60), Utc.with_ymd_and_hms(2022, 4, 2, 0, 0, 0).unwrap()),
//! ];
//! let start = Utc.with_ymd_and_hms(2022, 4, 10, 15, 45, 10).unwrap();
//! let end = Utc.with_ymd_and_hms(2022, 4, 11, 15, 45, 10).unwrap();
//!
//! let plan = Planner::new(&tables).plan(start, end, Duration::from_secs(120));
//! assert_eq!(plan.table(), "flows_1m0s");
//! assert_eq!(plan.render("{resolution} // {resolution->864}")?, "60 // 840");
//! # Ok::<(), flowplan::FlowplanError>(())
//! ```
//!
//! [`Snapshot`]: crate::registry::Snapshot

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::resolution::{effective_seconds, floor_to};
use crate::table::{RAW_TABLE, RollupTable};
use crate::template::{self, Bindings};

/// Selects flow tables from a borrowed table list.
#[derive(Debug, Clone, Copy)]
pub struct Planner<'a> {
    tables: &'a [RollupTable],
}

impl<'a> Planner<'a> {
    /// Creates a planner over `tables`. Order does not matter.
    pub fn new(tables: &'a [RollupTable]) -> Self {
        Self { tables }
    }

    /// Picks the table that best serves a query starting at `start` with
    /// at most `requested` resolution.
    ///
    /// Returns `None` when no table qualifies.
    pub fn select(&self, start: DateTime<Utc>, requested: Duration) -> Option<&'a RollupTable> {
        let (covering, partial): (Vec<&RollupTable>, Vec<&RollupTable>) =
            self.tables.iter().partition(|t| t.covers(start));

        if covering.is_empty() {
            return partial
                .into_iter()
                .filter(|t| t.resolution <= requested)
                .min_by(|a, b| a.oldest.cmp(&b.oldest).then_with(|| a.tie_break(b)));
        }

        let precise = covering
            .iter()
            .copied()
            .filter(|t| t.resolution <= requested)
            .min_by(|a, b| coarsest_first(a, b));

        precise.or_else(|| {
            covering
                .into_iter()
                .min_by(|a, b| a.resolution.cmp(&b.resolution).then_with(|| a.tie_break(b)))
        })
    }

    /// Builds the query plan for `start..end` at `requested` resolution.
    ///
    /// Never fails: without a qualifying table the plan falls back to the raw
    /// table name with unrounded bounds.
    pub fn plan(&self, start: DateTime<Utc>, end: DateTime<Utc>, requested: Duration) -> QueryPlan {
        let plan = match self.select(start, requested) {
            Some(table) => QueryPlan {
                table: table.name.clone(),
                resolution: table.resolution,
                start: floor_to(start, table.resolution),
                end: floor_to(end, table.resolution),
                requested_range: (start, end),
                requested_resolution: requested,
                may_be_incomplete: !table.covers(start),
                fallback: false,
            },
            None => QueryPlan {
                table: RAW_TABLE.to_string(),
                resolution: Duration::ZERO,
                start,
                end,
                requested_range: (start, end),
                requested_resolution: requested,
                may_be_incomplete: true,
                fallback: true,
            },
        };

        tracing::debug!(
            table = %plan.table,
            resolution = ?plan.resolution,
            requested = ?requested,
            fallback = plan.fallback,
            may_be_incomplete = plan.may_be_incomplete,
            "selected flow table"
        );
        plan
    }

    /// Selects a table and renders `template` against it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TemplateError`] if the template is malformed.
    pub fn render(
        &self,
        template: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        requested: Duration,
    ) -> Result<String> {
        self.plan(start, end, requested).render(template)
    }
}

/// Larger resolution first; ties fall back to [`RollupTable::tie_break`].
fn coarsest_first(a: &RollupTable, b: &RollupTable) -> Ordering {
    b.resolution
        .cmp(&a.resolution)
        .then_with(|| a.tie_break(b))
}

/// The outcome of table selection.
///
/// Owns everything it needs, so it stays valid after the snapshot it was
/// planned from has been replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    table: String,
    resolution: Duration,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    requested_range: (DateTime<Utc>, DateTime<Utc>),
    requested_resolution: Duration,
    may_be_incomplete: bool,
    fallback: bool,
}

impl QueryPlan {
    /// Name of the selected table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Native resolution of the selected table; zero for raw.
    pub fn resolution(&self) -> Duration {
        self.resolution
    }

    /// Granularity in seconds used by `{resolution}` placeholders.
    pub fn effective_seconds(&self) -> u64 {
        effective_seconds(self.resolution)
    }

    /// Rounded `(start, end)` used in the time filter.
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.start, self.end)
    }

    /// The `(start, end)` originally requested.
    pub fn requested_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        self.requested_range
    }

    /// The resolution originally requested.
    pub fn requested_resolution(&self) -> Duration {
        self.requested_resolution
    }

    /// Returns `true` when the selected table has already evicted part of
    /// the requested window, so the oldest part of the answer is missing.
    pub fn may_be_incomplete(&self) -> bool {
        self.may_be_incomplete
    }

    /// Returns `true` when no known table qualified and the raw table name
    /// was used blindly.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }

    /// Renders `template` against this plan.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TemplateError`] if the template is malformed.
    pub fn render(&self, template: &str) -> Result<String> {
        template::render(
            template,
            &Bindings {
                table: &self.table,
                start: self.start,
                end: self.end,
                resolution_secs: self.effective_seconds(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const MINUTE: Duration = Duration::from_secs(60);
    const HOUR: Duration = Duration::from_secs(3600);

    fn t(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 4, day, hour, minute, second).unwrap()
    }

    fn table(name: &str, resolution: Duration, oldest: DateTime<Utc>) -> RollupTable {
        RollupTable::new(name, resolution, oldest)
    }

    #[test]
    fn test_empty_snapshot_falls_back_to_raw() {
        let plan = Planner::new(&[]).plan(t(10, 15, 45, 10), t(11, 15, 45, 10), MINUTE);
        assert_eq!(plan.table(), "flows");
        assert_eq!(plan.bounds(), (t(10, 15, 45, 10), t(11, 15, 45, 10)));
        assert!(plan.is_fallback());
        assert!(plan.may_be_incomplete());
        assert_eq!(plan.effective_seconds(), 1);
    }

    #[test]
    fn test_covering_picks_coarsest_within_request() {
        let tables = [
            table("flows", Duration::ZERO, t(1, 0, 0, 0)),
            table("flows_1m0s", MINUTE, t(1, 0, 0, 0)),
            table("flows_5m0s", 5 * MINUTE, t(1, 0, 0, 0)),
            table("flows_1h0m0s", HOUR, t(1, 0, 0, 0)),
        ];
        let planner = Planner::new(&tables);
        let start = t(10, 0, 0, 0);
        assert_eq!(planner.select(start, Duration::ZERO).unwrap().name, "flows");
        assert_eq!(planner.select(start, 30 * Duration::from_secs(1)).unwrap().name, "flows");
        assert_eq!(planner.select(start, MINUTE).unwrap().name, "flows_1m0s");
        assert_eq!(planner.select(start, 10 * MINUTE).unwrap().name, "flows_5m0s");
        assert_eq!(planner.select(start, 2 * HOUR).unwrap().name, "flows_1h0m0s");
    }

    #[test]
    fn test_covering_but_too_coarse_picks_finest_covering() {
        let tables = [
            table("flows", Duration::ZERO, t(10, 22, 45, 10)),
            table("flows_5m0s", 5 * MINUTE, t(2, 22, 45, 10)),
            table("flows_1h0m0s", HOUR, t(1, 0, 0, 0)),
        ];
        let selected = Planner::new(&tables).select(t(10, 15, 46, 10), 2 * MINUTE).unwrap();
        assert_eq!(selected.name, "flows_5m0s");
    }

    #[test]
    fn test_nothing_covers_picks_earliest_oldest_within_request() {
        let tables = [
            table("flows", Duration::ZERO, t(10, 22, 40, 55)),
            table("flows_1m0s", MINUTE, t(10, 22, 40, 0)),
            table("flows_1h0m0s", HOUR, t(10, 22, 0, 10)),
        ];
        let plan = Planner::new(&tables).plan(t(10, 15, 46, 10), t(11, 15, 46, 10), 2 * MINUTE);
        assert_eq!(plan.table(), "flows_1m0s");
        assert!(plan.may_be_incomplete());
        assert!(!plan.is_fallback());
        assert_eq!(plan.bounds(), (t(10, 15, 46, 0), t(11, 15, 46, 0)));
    }

    #[test]
    fn test_nothing_covers_zero_request_restricts_to_raw() {
        let tables = [
            table("flows", Duration::ZERO, t(10, 22, 0, 0)),
            table("flows_1m0s", MINUTE, t(10, 16, 0, 0)),
        ];
        let selected = Planner::new(&tables).select(t(10, 15, 0, 0), Duration::ZERO).unwrap();
        assert_eq!(selected.name, "flows");
    }

    #[test]
    fn test_no_candidate_falls_back_to_raw_name() {
        // Only a coarse rollup, which does not cover and is coarser than requested.
        let tables = [table("flows_1h0m0s", HOUR, t(10, 22, 0, 0))];
        let plan = Planner::new(&tables).plan(t(10, 15, 30, 10), t(10, 16, 30, 10), MINUTE);
        assert_eq!(plan.table(), "flows");
        assert!(plan.is_fallback());
        assert_eq!(plan.bounds(), (t(10, 15, 30, 10), t(10, 16, 30, 10)));
    }

    #[test]
    fn test_ties_prefer_raw_then_name() {
        let oldest = t(10, 10, 0, 0);
        let tables = [
            table("flows_b", MINUTE, oldest),
            table("flows_a", MINUTE, oldest),
        ];
        let planner = Planner::new(&tables);
        assert_eq!(planner.select(t(10, 12, 0, 0), MINUTE).unwrap().name, "flows_a");
        // Both cover but are too coarse: finest covering, then name.
        assert_eq!(planner.select(t(10, 12, 0, 0), Duration::ZERO).unwrap().name, "flows_a");
        assert_eq!(planner.select(t(10, 8, 0, 0), MINUTE).unwrap().name, "flows_a");

        let tables = [
            table("flows_1m0s", MINUTE, oldest),
            table("flows", Duration::ZERO, oldest),
        ];
        // Nothing covers and both reach back equally far: raw wins.
        let selected = Planner::new(&tables).select(t(10, 8, 0, 0), MINUTE).unwrap();
        assert_eq!(selected.name, "flows");
    }

    #[test]
    fn test_plan_rounds_to_selected_resolution() {
        let tables = [table("flows_5m0s", 5 * MINUTE, t(1, 0, 0, 0))];
        let plan = Planner::new(&tables).plan(t(10, 15, 47, 10), t(10, 18, 3, 59), 5 * MINUTE);
        assert_eq!(plan.bounds(), (t(10, 15, 45, 0), t(10, 18, 0, 0)));
        assert_eq!(plan.requested_range(), (t(10, 15, 47, 10), t(10, 18, 3, 59)));
        assert_eq!(plan.requested_resolution(), 5 * MINUTE);
        assert_eq!(plan.effective_seconds(), 300);
        assert!(!plan.may_be_incomplete());
    }

    #[test]
    fn test_render_propagates_template_errors() {
        let tables = [table("flows", Duration::ZERO, t(1, 0, 0, 0))];
        let err = Planner::new(&tables)
            .render("{resolution->x}", t(10, 0, 0, 0), t(11, 0, 0, 0), MINUTE)
            .unwrap_err();
        assert!(matches!(err, crate::FlowplanError::Template(_)));
    }

    #[test]
    fn test_reversed_window_is_planned_as_given() {
        let tables = [table("flows_1m0s", MINUTE, t(1, 0, 0, 0))];
        let plan = Planner::new(&tables).plan(t(11, 0, 0, 30), t(10, 0, 0, 30), MINUTE);
        assert_eq!(plan.bounds(), (t(11, 0, 0, 0), t(10, 0, 0, 0)));
    }
}
