//! Configuration for the registry, the store client and query templates.
//!
//! Configuration is a JSON document. Every section has defaults, so an empty
//! object is a valid configuration pointing at a local ClickHouse:
//!
//! ```json
//! {
//!   "clickhouse": { "endpoint": "http://127.0.0.1:8123", "database": "default" },
//!   "refresh_interval": "1m0s",
//!   "resolutions": [
//!     { "interval": "0s",   "ttl": "360h0m0s" },
//!     { "interval": "1m0s", "ttl": "168h0m0s" }
//!   ],
//!   "templates": {
//!     "traffic": "SELECT toStartOfInterval(TimeReceived, INTERVAL {resolution->864} second) AS t, SUM(Bytes) FROM {table} WHERE {timefilter} GROUP BY t"
//!   }
//! }
//! ```
//!
//! Durations use the same text as table suffixes (`5m0s`, `1h0m0s`, `250ms`).
//! Templates are scanned at load time so authoring mistakes surface before
//! any query is served.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigurationError, FlowplanError, Result, TemplateError};
use crate::registry::Snapshot;
use crate::resolution::{format_resolution, table_name};
use crate::template::validate_template;

const DAY: u64 = 86_400;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowplanConfig {
    /// Connection to the analytic store.
    pub clickhouse: ClickHouseConfig,

    /// How often the registry is refreshed.
    #[serde(with = "duration_serde")]
    pub refresh_interval: Duration,

    /// Expected table layout, ordered from raw to coarsest.
    ///
    /// Used to report tables the orchestrator should have created but that
    /// were not discovered; selection itself only relies on discovery.
    pub resolutions: Vec<ResolutionConfig>,

    /// Named query templates.
    pub templates: BTreeMap<String, String>,
}

impl Default for FlowplanConfig {
    fn default() -> Self {
        Self {
            clickhouse: ClickHouseConfig::default(),
            refresh_interval: Duration::from_secs(60),
            resolutions: ResolutionConfig::default_layout(),
            templates: BTreeMap::new(),
        }
    }
}

impl FlowplanConfig {
    /// Reads, parses and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the file cannot be read or parsed,
    /// or if validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigurationError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval.is_zero() {
            return Err(ConfigurationError::InvalidValue {
                field: "refresh_interval".to_string(),
                reason: "must be non-zero".to_string(),
            }
            .into());
        }

        self.clickhouse.validate()?;
        validate_layout(&self.resolutions)?;

        for (name, template) in &self.templates {
            validate_template(template).map_err(|e| match e {
                FlowplanError::Template(source) => ConfigurationError::InvalidTemplate {
                    name: name.clone(),
                    source,
                }
                .into(),
                other => other,
            })?;
        }

        Ok(())
    }

    /// Returns the named template.
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError::UnknownTemplate`] if no template has that
    /// name.
    pub fn template(&self, name: &str) -> Result<&str> {
        self.templates
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| {
                TemplateError::UnknownTemplate {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Table names implied by the configured resolutions.
    pub fn expected_tables(&self) -> Vec<String> {
        self.resolutions.iter().map(ResolutionConfig::table_name).collect()
    }

    /// Configured tables that `snapshot` does not contain.
    pub fn missing_tables(&self, snapshot: &Snapshot) -> Vec<String> {
        self.expected_tables()
            .into_iter()
            .filter(|name| snapshot.get(name).is_none())
            .collect()
    }
}

/// Connection settings for the ClickHouse HTTP interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClickHouseConfig {
    /// Base URL of the HTTP interface.
    pub endpoint: String,
    /// Database holding the flow tables.
    pub database: String,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Per-request timeout.
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Backoff before the first retry, doubled on each subsequent one.
    #[serde(with = "duration_serde")]
    pub retry_backoff: Duration,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8123".to_string(),
            database: "default".to_string(),
            username: "default".to_string(),
            password: String::new(),
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl ClickHouseConfig {
    /// Creates a config for `endpoint` with default settings.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Sets the database.
    #[must_use]
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Sets the credentials.
    #[must_use]
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the backoff before the first retry.
    #[must_use]
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Validates the connection settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidValue`] for an empty endpoint or
    /// database, or a zero timeout.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, reason: &str| ConfigurationError::InvalidValue {
            field: format!("clickhouse.{field}"),
            reason: reason.to_string(),
        };

        if !(self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://")) {
            return Err(invalid("endpoint", "must be an http:// or https:// URL").into());
        }
        if self.database.is_empty() {
            return Err(invalid("database", "cannot be empty").into());
        }
        if self.timeout.is_zero() {
            return Err(invalid("timeout", "must be non-zero").into());
        }
        Ok(())
    }
}

/// One entry of the expected table layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResolutionConfig {
    /// Bucket width; zero for the raw table.
    #[serde(with = "duration_serde")]
    pub interval: Duration,

    /// How long rows are kept.
    #[serde(with = "duration_serde")]
    pub ttl: Duration,
}

impl ResolutionConfig {
    /// Creates a layout entry.
    pub fn new(interval: Duration, ttl: Duration) -> Self {
        Self { interval, ttl }
    }

    /// The layout flows are usually deployed with: raw data for 15 days,
    /// then 1m, 5m and 1h rollups for a week, three months and a year.
    pub fn default_layout() -> Vec<Self> {
        vec![
            Self::new(Duration::ZERO, Duration::from_secs(15 * DAY)),
            Self::new(Duration::from_secs(60), Duration::from_secs(7 * DAY)),
            Self::new(Duration::from_secs(300), Duration::from_secs(90 * DAY)),
            Self::new(Duration::from_secs(3600), Duration::from_secs(365 * DAY)),
        ]
    }

    /// Name of the table holding this resolution.
    pub fn table_name(&self) -> String {
        table_name(self.interval)
    }

    /// Validates this entry on its own.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidResolution`] for a zero TTL, or a
    /// rollup kept for less than one bucket.
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(ConfigurationError::InvalidResolution {
                reason: format!("ttl of {} cannot be zero", self.table_name()),
            }
            .into());
        }

        if self.ttl < self.interval {
            return Err(ConfigurationError::InvalidResolution {
                reason: format!(
                    "ttl of {} ({}) must be >= its interval ({})",
                    self.table_name(),
                    format_resolution(self.ttl),
                    format_resolution(self.interval)
                ),
            }
            .into());
        }

        Ok(())
    }
}

fn validate_layout(resolutions: &[ResolutionConfig]) -> Result<()> {
    let Some(first) = resolutions.first() else {
        return Err(ConfigurationError::InvalidResolution {
            reason: "at least one resolution must be configured".to_string(),
        }
        .into());
    };

    if !first.interval.is_zero() {
        return Err(ConfigurationError::InvalidResolution {
            reason: "the first resolution must be the raw table (interval 0s)".to_string(),
        }
        .into());
    }

    for resolution in resolutions {
        resolution.validate()?;
    }

    // Strictly increasing intervals also rule out a second raw entry.
    for window in resolutions.windows(2) {
        if window[0].interval >= window[1].interval {
            return Err(ConfigurationError::InvalidResolution {
                reason: format!(
                    "resolutions must be strictly increasing: {} is followed by {}",
                    format_resolution(window[0].interval),
                    format_resolution(window[1].interval)
                ),
            }
            .into());
        }
    }

    Ok(())
}

/// Serde support for Duration fields.
///
/// Durations are written in the canonical duration text (`1m0s`) so that
/// configuration files and snapshot dumps read like the table names.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    use crate::resolution::{format_resolution, parse_resolution};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_resolution(*duration))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        parse_resolution(&text).map_err(de::Error::custom)
    }
}
