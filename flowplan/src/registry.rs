//! Flow table registry.
//!
//! The registry keeps the current list of flow tables and their retention
//! bounds, as last measured from the store catalog. The list is published as
//! an immutable [`Snapshot`] behind an [`ArcSwap`]:
//!
//! - Readers call [`Registry::snapshot`] and get an `Arc<Snapshot>` without
//!   taking a lock. They keep seeing that snapshot for as long as they hold
//!   it, whatever refreshes happen meanwhile.
//! - [`Registry::refresh`] builds a complete new table list off to the side
//!   and publishes it with a single pointer swap. A failed or cancelled
//!   refresh publishes nothing, so the previous snapshot keeps serving.
//!
//! Refreshes may overlap. Each one takes a ticket when it starts, and a
//! snapshot is only published if no refresh that started later has already
//! published, so a slow refresh never replaces fresher data.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use flowplan::registry::Registry;
//! use flowplan::store::MemoryFlowStore;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), flowplan::FlowplanError> {
//! let oldest = Utc.with_ymd_and_hms(2022, 3, 10, 0, 0, 0).unwrap();
//! let store = MemoryFlowStore::new()
//!     .with_table("flows", "MergeTree", Some(oldest))
//!     .with_table("flows_1m0s", "SummingMergeTree", Some(oldest));
//!
//! let registry = Registry::new();
//! assert!(registry.snapshot().is_empty());
//!
//! registry.refresh(&store, &CancellationToken::new())?;
//! assert_eq!(registry.snapshot().tables().len(), 2);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ConfigurationError, DiscoveryError, FlowplanError, MetadataError, Result};
use crate::planner::{Planner, QueryPlan};
use crate::resolution::{format_resolution, resolution_from_table_name};
use crate::store::FlowStore;
use crate::table::RollupTable;

/// An immutable view of the known flow tables.
///
/// Deserializing goes through [`Snapshot::new`], after checking that every
/// table name agrees with its resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SnapshotRecord")]
pub struct Snapshot {
    /// Tables ordered by resolution (raw first), then name.
    tables: Vec<RollupTable>,

    /// Ticket of the refresh that produced this snapshot; 0 before any.
    version: u64,

    /// When the producing refresh finished, if it came from a refresh.
    refreshed_at: Option<DateTime<Utc>>,
}

/// Serialized form of a [`Snapshot`], before normalization.
#[derive(Deserialize)]
struct SnapshotRecord {
    tables: Vec<RollupTable>,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    refreshed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SnapshotRecord> for Snapshot {
    type Error = FlowplanError;

    fn try_from(record: SnapshotRecord) -> Result<Self> {
        for table in &record.tables {
            if resolution_from_table_name(&table.name)? != table.resolution {
                return Err(ConfigurationError::InvalidTableName {
                    name: table.name.clone(),
                    reason: format!("does not match resolution {}", format_resolution(table.resolution)),
                }
                .into());
            }
        }
        Ok(Self::new(record.tables, record.version, record.refreshed_at))
    }
}

impl Snapshot {
    /// Creates a snapshot from an arbitrary table list.
    ///
    /// Tables are sorted into the canonical order. Duplicate names keep the
    /// first occurrence, and only the first raw table is kept.
    pub fn new(tables: Vec<RollupTable>, version: u64, refreshed_at: Option<DateTime<Utc>>) -> Self {
        let mut seen = BTreeSet::new();
        let mut has_raw = false;
        let mut tables: Vec<_> = tables
            .into_iter()
            .filter(|t| {
                if !seen.insert(t.name.clone()) {
                    return false;
                }
                if t.is_raw() {
                    if has_raw {
                        return false;
                    }
                    has_raw = true;
                }
                true
            })
            .collect();
        tables.sort_by(RollupTable::layout_order);
        Self {
            tables,
            version,
            refreshed_at,
        }
    }

    /// Tables ordered by resolution (raw first), then name.
    pub fn tables(&self) -> &[RollupTable] {
        &self.tables
    }

    /// Returns `true` before the first successful refresh.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Refresh ticket that produced this snapshot.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// When this snapshot was measured.
    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    /// Looks up a table by name.
    pub fn get(&self, name: &str) -> Option<&RollupTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns a planner over this snapshot.
    pub fn planner(&self) -> Planner<'_> {
        Planner::new(&self.tables)
    }
}

/// Holds the published [`Snapshot`] and refreshes it from a [`FlowStore`].
#[derive(Debug)]
pub struct Registry {
    current: ArcSwap<Snapshot>,
    tickets: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates a registry with an empty snapshot.
    pub fn new() -> Self {
        Self::with_snapshot(Snapshot::default())
    }

    /// Creates a registry pre-seeded with `snapshot`.
    pub fn with_snapshot(snapshot: Snapshot) -> Self {
        let tickets = AtomicU64::new(snapshot.version);
        Self {
            current: ArcSwap::from_pointee(snapshot),
            tickets,
        }
    }

    /// Creates a registry pre-seeded with `tables` as version 1.
    pub fn with_tables(tables: Vec<RollupTable>) -> Self {
        Self::with_snapshot(Snapshot::new(tables, 1, None))
    }

    /// Returns the currently published snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Re-reads the flow tables from `store` and publishes a new snapshot.
    ///
    /// Lists the flow tables, parses each name into a resolution, probes each
    /// table for its oldest row (an empty table counts as starting now) and
    /// publishes the sorted result. `cancel` is checked before the listing
    /// and before every probe.
    ///
    /// Returns the snapshot in effect afterwards. When a refresh that started
    /// later has already published, that newer snapshot is returned and this
    /// one is dropped.
    ///
    /// # Errors
    ///
    /// - [`DiscoveryError`] if the listing fails or is cancelled
    /// - [`crate::error::ConfigurationError`] if a table name does not parse
    /// - [`MetadataError`] if a probe fails or is cancelled
    ///
    /// On error the previous snapshot stays published.
    pub fn refresh<S>(&self, store: &S, cancel: &CancellationToken) -> Result<Arc<Snapshot>>
    where
        S: FlowStore + ?Sized,
    {
        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();

        let tables = match discover(store, cancel) {
            Ok(tables) => tables,
            Err(e) => {
                if e.is_cancelled() {
                    tracing::info!(ticket, "flow table refresh cancelled, keeping previous snapshot");
                } else {
                    tracing::warn!(ticket, error = %e, "flow table refresh failed, keeping previous snapshot");
                }
                return Err(e);
            }
        };

        let candidate = Arc::new(Snapshot::new(tables, ticket, Some(Utc::now())));
        let previous = self.current.rcu(|current| {
            if current.version > ticket {
                Arc::clone(current)
            } else {
                Arc::clone(&candidate)
            }
        });

        if previous.version > ticket {
            tracing::debug!(
                ticket,
                current = previous.version,
                "flow table refresh superseded by a newer one"
            );
            return Ok(self.snapshot());
        }

        tracing::info!(
            version = ticket,
            tables = candidate.tables.len(),
            elapsed_ms = duration_ms(started.elapsed()),
            "flow tables refreshed"
        );
        Ok(candidate)
    }

    /// Plans a query against the current snapshot.
    pub fn plan(&self, start: DateTime<Utc>, end: DateTime<Utc>, resolution: Duration) -> QueryPlan {
        self.snapshot().planner().plan(start, end, resolution)
    }

    /// Renders `template` against the current snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::TemplateError`] if the template is malformed.
    pub fn render(
        &self,
        template: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Duration,
    ) -> Result<String> {
        self.plan(start, end, resolution).render(template)
    }
}

fn discover<S>(store: &S, cancel: &CancellationToken) -> Result<Vec<RollupTable>>
where
    S: FlowStore + ?Sized,
{
    if cancel.is_cancelled() {
        return Err(DiscoveryError::Cancelled.into());
    }

    let mut seen = BTreeSet::new();
    let mut layout = Vec::new();
    for entry in store.list_flow_tables(cancel)? {
        if !entry.is_flow_table() {
            tracing::debug!(table = %entry.name, engine = %entry.engine, "ignoring non flow table");
            continue;
        }
        if !seen.insert(entry.name.clone()) {
            continue;
        }
        let resolution = resolution_from_table_name(&entry.name)?;
        layout.push((entry.name, resolution));
    }

    let mut tables = Vec::with_capacity(layout.len());
    for (name, resolution) in layout {
        if cancel.is_cancelled() {
            return Err(MetadataError::Cancelled { table: name }.into());
        }
        let oldest = match store.min_timestamp(&name, cancel)? {
            Some(oldest) => oldest,
            None => {
                tracing::debug!(table = %name, "flow table is empty");
                Utc::now()
            }
        };
        tracing::debug!(table = %name, resolution = ?resolution, %oldest, "probed flow table");
        tables.push(RollupTable::new(name, resolution, oldest));
    }

    Ok(tables)
}

#[allow(clippy::cast_possible_truncation)] // refreshes do not last 584 million years
fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis() as u64
}
