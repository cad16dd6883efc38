//! Storage collaborator contract.
//!
//! The registry never talks to the analytic store directly; it goes through
//! [`FlowStore`], which exposes exactly the two catalog probes a refresh
//! needs. [`MemoryFlowStore`] is an in-process implementation used for
//! offline planning and tests. The HTTP client for ClickHouse lives in
//! the `clickhouse` module behind the `clickhouse-http` feature.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{DiscoveryError, MetadataError, Result};
use crate::table::{RAW_TABLE, RollupTable};

/// A table returned by the store catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    /// Table name.
    pub name: String,
    /// Storage engine reported by the catalog (e.g. `ReplicatedMergeTree`).
    pub engine: String,
}

impl CatalogEntry {
    /// Creates a catalog entry.
    pub fn new(name: impl Into<String>, engine: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine: engine.into(),
        }
    }

    /// Returns `true` if the entry is a flow table on a compatible engine.
    pub fn is_flow_table(&self) -> bool {
        is_flow_table_name(&self.name) && is_merge_tree_engine(&self.engine)
    }
}

/// The analytic store as seen by the registry.
///
/// Implementations perform blocking I/O. Both calls may be retried by the
/// caller, so they must not have side effects. A call that waits on the
/// network should give up once `cancel` fires and report
/// [`DiscoveryError::Cancelled`] or [`MetadataError::Cancelled`].
pub trait FlowStore: Send + Sync {
    /// Lists the tables named like flow tables on a merge-tree engine.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] on transport or authentication failure,
    /// or if cancelled.
    fn list_flow_tables(&self, cancel: &CancellationToken) -> Result<Vec<CatalogEntry>>;

    /// Returns the earliest `TimeReceived` retained in `table`, or `None`
    /// if the table holds no rows.
    ///
    /// # Errors
    ///
    /// Returns [`MetadataError`] if the table cannot be queried, or if
    /// cancelled.
    fn min_timestamp(&self, table: &str, cancel: &CancellationToken) -> Result<Option<DateTime<Utc>>>;
}

impl<T: FlowStore + ?Sized> FlowStore for &T {
    fn list_flow_tables(&self, cancel: &CancellationToken) -> Result<Vec<CatalogEntry>> {
        (**self).list_flow_tables(cancel)
    }

    fn min_timestamp(&self, table: &str, cancel: &CancellationToken) -> Result<Option<DateTime<Utc>>> {
        (**self).min_timestamp(table, cancel)
    }
}

impl<T: FlowStore + ?Sized> FlowStore for Box<T> {
    fn list_flow_tables(&self, cancel: &CancellationToken) -> Result<Vec<CatalogEntry>> {
        (**self).list_flow_tables(cancel)
    }

    fn min_timestamp(&self, table: &str, cancel: &CancellationToken) -> Result<Option<DateTime<Utc>>> {
        (**self).min_timestamp(table, cancel)
    }
}

impl<T: FlowStore + ?Sized> FlowStore for Arc<T> {
    fn list_flow_tables(&self, cancel: &CancellationToken) -> Result<Vec<CatalogEntry>> {
        (**self).list_flow_tables(cancel)
    }

    fn min_timestamp(&self, table: &str, cancel: &CancellationToken) -> Result<Option<DateTime<Utc>>> {
        (**self).min_timestamp(table, cancel)
    }
}

/// Returns `true` for `flows` and `flows_*`.
///
/// The suffix is not validated here; a table that matches the prefix but
/// carries an unparseable suffix is a naming-convention mismatch and fails
/// the refresh.
pub fn is_flow_table_name(name: &str) -> bool {
    name == RAW_TABLE
        || name
            .strip_prefix(RAW_TABLE)
            .is_some_and(|rest| rest.starts_with('_'))
}

/// Returns `true` for engines of the merge-tree family.
///
/// Views, dictionaries and Kafka/Distributed engines share the naming prefix
/// in some deployments and are excluded.
pub fn is_merge_tree_engine(engine: &str) -> bool {
    engine.ends_with("MergeTree")
}

/// An in-memory [`FlowStore`].
///
/// Holds a fixed catalog with per-table oldest timestamps. Failures can be
/// injected to exercise the refresh error paths.
#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    tables: BTreeMap<String, (String, Option<DateTime<Utc>>)>,
    fail_listing: Option<String>,
    fail_probe: BTreeMap<String, String>,
    probes: AtomicUsize,
}

impl MemoryFlowStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given tables on a `MergeTree` engine.
    pub fn from_tables<'a, I>(tables: I) -> Self
    where
        I: IntoIterator<Item = &'a RollupTable>,
    {
        let mut store = Self::new();
        for table in tables {
            store = store.with_table(&table.name, "MergeTree", Some(table.oldest));
        }
        store
    }

    /// Adds a table. `oldest = None` models an empty table.
    #[must_use]
    pub fn with_table(
        mut self,
        name: impl Into<String>,
        engine: impl Into<String>,
        oldest: Option<DateTime<Utc>>,
    ) -> Self {
        self.tables.insert(name.into(), (engine.into(), oldest));
        self
    }

    /// Makes [`FlowStore::list_flow_tables`] fail with `reason`.
    #[must_use]
    pub fn failing_listing(mut self, reason: impl Into<String>) -> Self {
        self.fail_listing = Some(reason.into());
        self
    }

    /// Makes [`FlowStore::min_timestamp`] fail for `table`.
    #[must_use]
    pub fn failing_probe(mut self, table: impl Into<String>, reason: impl Into<String>) -> Self {
        self.fail_probe.insert(table.into(), reason.into());
        self
    }

    /// Returns how many minimum-timestamp probes have been issued.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::Relaxed)
    }
}

impl FlowStore for MemoryFlowStore {
    fn list_flow_tables(&self, _cancel: &CancellationToken) -> Result<Vec<CatalogEntry>> {
        if let Some(reason) = &self.fail_listing {
            return Err(DiscoveryError::ListFailed {
                reason: reason.clone(),
            }
            .into());
        }

        Ok(self
            .tables
            .iter()
            .map(|(name, (engine, _))| CatalogEntry::new(name, engine))
            .filter(CatalogEntry::is_flow_table)
            .collect())
    }

    fn min_timestamp(&self, table: &str, _cancel: &CancellationToken) -> Result<Option<DateTime<Utc>>> {
        self.probes.fetch_add(1, Ordering::Relaxed);

        if let Some(reason) = self.fail_probe.get(table) {
            return Err(MetadataError::ProbeFailed {
                table: table.to_string(),
                reason: reason.clone(),
            }
            .into());
        }

        match self.tables.get(table) {
            Some((_, oldest)) => Ok(*oldest),
            None => Err(MetadataError::ProbeFailed {
                table: table.to_string(),
                reason: "table does not exist".to_string(),
            }
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_flow_table_name_filter() {
        assert!(is_flow_table_name("flows"));
        assert!(is_flow_table_name("flows_1m0s"));
        assert!(is_flow_table_name("flows_whatever"));
        assert!(!is_flow_table_name("flowsx"));
        assert!(!is_flow_table_name("exporters"));
        assert!(!is_flow_table_name("raw_flows"));
    }

    #[test]
    fn test_engine_filter() {
        assert!(is_merge_tree_engine("MergeTree"));
        assert!(is_merge_tree_engine("SummingMergeTree"));
        assert!(is_merge_tree_engine("ReplicatedSummingMergeTree"));
        assert!(!is_merge_tree_engine("Kafka"));
        assert!(!is_merge_tree_engine("MaterializedView"));
        assert!(!is_merge_tree_engine("Distributed"));
    }

    #[test]
    fn test_memory_store_lists_only_flow_tables() {
        let t = Utc.with_ymd_and_hms(2022, 4, 10, 0, 0, 0).unwrap();
        let store = MemoryFlowStore::new()
            .with_table("flows", "MergeTree", Some(t))
            .with_table("flows_1m0s", "SummingMergeTree", Some(t))
            .with_table("flows_1m0s_consumer", "MaterializedView", None)
            .with_table("flows_raw", "Kafka", None)
            .with_table("exporters", "ReplacingMergeTree", None);

        let names: Vec<_> = store
            .list_flow_tables(&CancellationToken::new())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["flows", "flows_1m0s"]);
    }

    #[test]
    fn test_memory_store_probe() {
        let t = Utc.with_ymd_and_hms(2022, 4, 10, 0, 0, 0).unwrap();
        let store = MemoryFlowStore::new()
            .with_table("flows", "MergeTree", Some(t))
            .with_table("flows_5m0s", "MergeTree", None)
            .failing_probe("flows_1h0m0s", "timeout");

        let cancel = CancellationToken::new();
        assert_eq!(store.min_timestamp("flows", &cancel).unwrap(), Some(t));
        assert_eq!(store.min_timestamp("flows_5m0s", &cancel).unwrap(), None);
        assert!(store.min_timestamp("flows_1h0m0s", &cancel).is_err());
        assert!(store.min_timestamp("missing", &cancel).is_err());
        assert_eq!(store.probe_count(), 4);
    }

    #[test]
    fn test_memory_store_listing_failure() {
        let store = MemoryFlowStore::new().failing_listing("connection refused");
        let err = store.list_flow_tables(&CancellationToken::new()).unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }
}
