//! ClickHouse implementation of [`FlowStore`] over the HTTP interface.
//!
//! Queries are POSTed as the request body with `FORMAT JSONEachRow` and
//! retried with exponential backoff. Requests are blocking; callers on an
//! async runtime should run refreshes on a blocking thread.
//!
//! This module is only available when the `clickhouse-http` feature is
//! enabled.
//!
//! # Example
//!
//! ```rust,no_run
//! use flowplan::clickhouse::ClickHouseStore;
//! use flowplan::config::ClickHouseConfig;
//! use flowplan::registry::Registry;
//! use tokio_util::sync::CancellationToken;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = ClickHouseStore::new(ClickHouseConfig::new("http://127.0.0.1:8123"))?;
//! let registry = Registry::new();
//! registry.refresh(&store, &CancellationToken::new())?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::ClickHouseConfig;
use crate::error::{ConfigurationError, DiscoveryError, MetadataError, Result};
use crate::store::{CatalogEntry, FlowStore, is_flow_table_name};
use crate::table::RAW_TABLE;
use crate::template::TIME_COLUMN;

/// Longest uninterrupted sleep while waiting out a retry backoff.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// A [`FlowStore`] backed by a ClickHouse server.
#[derive(Debug, Clone)]
pub struct ClickHouseStore {
    config: ClickHouseConfig,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    name: String,
    engine: String,
}

#[derive(Debug, Deserialize)]
struct MinRow {
    t: UnixSeconds,
}

/// `toUnixTimestamp` output. Integers wider than 32 bits may arrive quoted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UnixSeconds {
    Number(i64),
    Text(String),
}

/// Why a query produced no body.
#[derive(Debug)]
enum QueryError {
    Cancelled,
    Failed(String),
}

impl ClickHouseStore {
    /// Creates a client for the configured server.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the configuration is invalid or the
    /// HTTP client cannot be built.
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        config.validate()?;
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ConfigurationError::InvalidValue {
                field: "clickhouse".to_string(),
                reason: format!("failed to create HTTP client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    /// Returns the connection settings.
    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }

    /// Runs `sql` with retries and returns the response body.
    ///
    /// `cancel` is checked before every attempt and throughout each backoff.
    /// A request already on the wire runs until it answers or times out.
    fn query(&self, sql: &str, cancel: &CancellationToken) -> std::result::Result<String, QueryError> {
        let mut last_error = String::new();
        let mut backoff = self.config.retry_backoff;

        for attempt in 0..=self.config.max_retries {
            if cancel.is_cancelled() {
                return Err(QueryError::Cancelled);
            }

            let request = self
                .client
                .post(&self.config.endpoint)
                .header("X-ClickHouse-User", &self.config.username)
                .header("X-ClickHouse-Key", &self.config.password)
                .header("X-ClickHouse-Database", &self.config.database)
                .body(sql.to_string());

            match request.send() {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .text()
                        .map_err(|e| QueryError::Failed(format!("failed to read response: {e}")));
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let body = resp.text().unwrap_or_default();
                    last_error = format!("server returned status {status}: {}", body.trim());
                }
                Err(e) => {
                    last_error = format!("request failed: {e}");
                }
            }

            if attempt < self.config.max_retries {
                tracing::debug!(attempt, error = %last_error, "retrying ClickHouse query");
                if !sleep_unless_cancelled(backoff, cancel) {
                    return Err(QueryError::Cancelled);
                }
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(QueryError::Failed(last_error))
    }
}

impl FlowStore for ClickHouseStore {
    fn list_flow_tables(&self, cancel: &CancellationToken) -> Result<Vec<CatalogEntry>> {
        let sql = format!(
            "SELECT name, engine FROM system.tables \
             WHERE database = currentDatabase() AND name LIKE '{RAW_TABLE}%' AND engine LIKE '%MergeTree' \
             FORMAT JSONEachRow"
        );
        let body = self.query(&sql, cancel).map_err(|e| match e {
            QueryError::Cancelled => DiscoveryError::Cancelled,
            QueryError::Failed(reason) => DiscoveryError::ListFailed { reason },
        })?;
        parse_catalog(&body)
    }

    fn min_timestamp(&self, table: &str, cancel: &CancellationToken) -> Result<Option<DateTime<Utc>>> {
        if !is_flow_table_name(table) || !table.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
            return Err(MetadataError::ProbeFailed {
                table: table.to_string(),
                reason: "not a flow table identifier".to_string(),
            }
            .into());
        }

        // Unix seconds do not depend on the server or column timezone.
        let sql = format!("SELECT toUnixTimestamp(MIN({TIME_COLUMN})) AS t FROM {table} FORMAT JSONEachRow");
        let body = self.query(&sql, cancel).map_err(|e| match e {
            QueryError::Cancelled => MetadataError::Cancelled {
                table: table.to_string(),
            },
            QueryError::Failed(reason) => MetadataError::ProbeFailed {
                table: table.to_string(),
                reason,
            },
        })?;
        parse_min_timestamp(table, &body)
    }
}

/// Sleeps for `duration`, waking early if `cancel` fires.
///
/// Returns `false` if cancelled.
fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let slice = remaining.min(CANCEL_POLL);
        std::thread::sleep(slice);
        remaining -= slice;
    }
    !cancel.is_cancelled()
}

/// Decodes a `JSONEachRow` catalog listing, keeping flow tables only.
fn parse_catalog(body: &str) -> Result<Vec<CatalogEntry>> {
    let mut entries = Vec::new();
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let row: CatalogRow =
            serde_json::from_str(line).map_err(|source| DiscoveryError::Decode { source })?;
        let entry = CatalogEntry::new(row.name, row.engine);
        if entry.is_flow_table() {
            entries.push(entry);
        }
    }
    Ok(entries)
}

/// Decodes a `toUnixTimestamp(MIN(TimeReceived))` answer.
///
/// `MIN` over an empty table yields the epoch, so zero and an empty body
/// both mean the table has no rows.
fn parse_min_timestamp(table: &str, body: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(line) = body.lines().find(|l| !l.trim().is_empty()) else {
        return Ok(None);
    };

    let invalid = || MetadataError::InvalidTimestamp {
        table: table.to_string(),
        value: line.to_string(),
    };
    let row: MinRow = serde_json::from_str(line).map_err(|_| invalid())?;
    let secs = match row.t {
        UnixSeconds::Number(secs) => secs,
        UnixSeconds::Text(text) => text.trim().parse::<i64>().map_err(|_| invalid())?,
    };

    if secs == 0 {
        return Ok(None);
    }
    DateTime::from_timestamp(secs, 0).map(Some).ok_or_else(|| invalid().into())
}
