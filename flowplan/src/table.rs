//! The rollup table value type.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the unaggregated flow table.
///
/// It is also the table queried when nothing better is known, such as before
/// the first successful refresh.
pub const RAW_TABLE: &str = "flows";

/// A physical flow table and its retention bounds.
///
/// Rollup tables hold flows pre-aggregated into buckets of `resolution`;
/// the raw table has a resolution of zero. `oldest` is the earliest row
/// still retained and moves forward as retention evicts data, so it is
/// re-measured on every refresh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollupTable {
    /// Physical table name.
    pub name: String,

    /// Aggregation bucket width; zero for the raw table.
    #[serde(with = "crate::config::duration_serde")]
    pub resolution: Duration,

    /// Earliest retained `TimeReceived`.
    pub oldest: DateTime<Utc>,
}

impl RollupTable {
    /// Creates a table description.
    pub fn new(name: impl Into<String>, resolution: Duration, oldest: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            resolution,
            oldest,
        }
    }

    /// Returns `true` for the unaggregated table.
    pub fn is_raw(&self) -> bool {
        self.resolution.is_zero()
    }

    /// Returns `true` if the retained history reaches back to `start`.
    pub fn covers(&self, start: DateTime<Utc>) -> bool {
        self.oldest <= start
    }

    /// Snapshot ordering: resolution ascending (raw first), then name.
    pub fn layout_order(&self, other: &Self) -> Ordering {
        self.resolution
            .cmp(&other.resolution)
            .then_with(|| self.name.cmp(&other.name))
    }

    /// Preference among otherwise equal candidates: raw first, then name.
    pub(crate) fn tie_break(&self, other: &Self) -> Ordering {
        other
            .is_raw()
            .cmp(&self.is_raw())
            .then_with(|| self.name.cmp(&other.name))
    }
}
