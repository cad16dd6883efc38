//! # flowplan
//!
//! Flow table registry and query planner for ClickHouse flow storage.
//!
//! Flow records land in a raw `flows` table and are continuously rolled up
//! into coarser aggregate tables such as `flows_1m0s` or `flows_1h0m0s`. Each
//! table keeps data for a different retention period. flowplan keeps track
//! of which tables exist and how far back each one reaches, and rewrites
//! query templates against the best table for a time range and a requested
//! resolution.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Lock-free reads: planning works on an immutable snapshot
//! - Refreshes build off to the side and publish atomically
//! - A stale refresh never overwrites a fresher one
//! - Rendering is pure and never fails on an empty registry
//!
//! ## Quick Start
//!
//! ```rust
//! use chrono::{TimeZone, Utc};
//! use flowplan::{Registry, RollupTable};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let oldest = Utc.with_ymd_and_hms(2022, 3, 10, 15, 45, 10).unwrap();
//! let registry = Registry::with_tables(vec![
//!     RollupTable::new("flows", Duration::ZERO, oldest),
//!     RollupTable::new("flows_1m0s", Duration::from_secs(60), oldest),
//! ]);
//!
//! let start = Utc.with_ymd_and_hms(2022, 4, 10, 15, 45, 10).unwrap();
//! let end = Utc.with_ymd_and_hms(2022, 4, 11, 15, 45, 10).unwrap();
//! let sql = registry.render(
//!     "SELECT 1 FROM {table} WHERE {timefilter}",
//!     start,
//!     end,
//!     Duration::from_secs(120),
//! )?;
//! assert_eq!(
//!     sql,
//!     "SELECT 1 FROM flows_1m0s WHERE TimeReceived BETWEEN \
//!      toDateTime('2022-04-10 15:45:00', 'UTC') AND toDateTime('2022-04-11 15:45:00', 'UTC')"
//! );
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Registry`]: Publishes table [`Snapshot`]s and refreshes them from a store
//! - [`FlowStore`]: Catalog listing and oldest-row probes
//! - [`Planner`]: Picks a table and rounds the window, producing a [`QueryPlan`]
//! - [`FlowplanConfig`]: Connection, refresh and template settings
//!
//! ## Modules
//!
//! - [`registry`]: Snapshot publication and refresh
//! - [`planner`]: Table selection
//! - [`template`]: Placeholder grammar and rendering
//! - [`table`]: Flow table descriptor
//! - [`resolution`]: Duration text format and time rounding
//! - [`store`]: Store abstraction and in-memory store
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types
//! - `clickhouse`: HTTP store (feature `clickhouse-http`)

#[cfg(feature = "clickhouse-http")]
pub mod clickhouse;
pub mod config;
pub mod error;
pub mod planner;
pub mod registry;
pub mod resolution;
pub mod store;
pub mod table;
pub mod template;

// Re-export primary API types at crate root for convenience.
pub use config::{ClickHouseConfig, FlowplanConfig, ResolutionConfig};
pub use error::{FlowplanError, Result};
pub use planner::{Planner, QueryPlan};
pub use registry::{Registry, Snapshot};
pub use store::{CatalogEntry, FlowStore, MemoryFlowStore};
pub use table::{RAW_TABLE, RollupTable};
