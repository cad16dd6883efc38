//! Error types for the flowplan registry and planner.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for all flowplan operations.
///
/// Refresh-time failures ([`DiscoveryError`], [`MetadataError`],
/// [`ConfigurationError`] for table names) leave the previously published
/// snapshot in place. Render-time failures ([`TemplateError`]) only fail the
/// query being rendered.
#[derive(Error, Debug)]
pub enum FlowplanError {
    /// Listing the flow tables from the store failed.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Probing a table's oldest retained row failed.
    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// A query template is malformed.
    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    /// A duration, table name or configuration value is invalid.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

impl FlowplanError {
    /// Returns `true` if this error was caused by cancellation rather than
    /// by the store or the input.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Discovery(DiscoveryError::Cancelled) | Self::Metadata(MetadataError::Cancelled { .. })
        )
    }
}

/// Errors that can occur while listing the flow tables.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The store could not be reached or rejected the request.
    #[error("failed to list flow tables: {reason}")]
    ListFailed {
        /// Description of the failure.
        reason: String,
    },

    /// The store answered with a body that could not be decoded.
    #[error("failed to decode table listing: {source}")]
    Decode {
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// The refresh was cancelled before the listing completed.
    #[error("refresh cancelled before table listing")]
    Cancelled,
}

/// Errors that can occur while probing the oldest row of a table.
#[derive(Error, Debug)]
pub enum MetadataError {
    /// The minimum-timestamp query failed.
    #[error("failed to query oldest row of '{table}': {reason}")]
    ProbeFailed {
        /// The table being probed.
        table: String,
        /// Description of the failure.
        reason: String,
    },

    /// The store returned a timestamp that could not be parsed.
    #[error("invalid timestamp '{value}' returned for '{table}'")]
    InvalidTimestamp {
        /// The table being probed.
        table: String,
        /// The raw value returned by the store.
        value: String,
    },

    /// The refresh was cancelled before this table was probed.
    #[error("refresh cancelled before probing '{table}'")]
    Cancelled {
        /// The next table that would have been probed.
        table: String,
    },
}

/// Errors that can occur while scanning or rendering a query template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// `{resolution-><N>}` where `N` is not a non-negative integer.
    #[error("invalid bucket width '{value}' in placeholder at byte {offset}")]
    InvalidBucket {
        /// The text found after `->`.
        value: String,
        /// Byte offset of the opening brace.
        offset: usize,
    },

    /// A named template referenced by the caller does not exist.
    #[error("unknown template '{name}'")]
    UnknownTemplate {
        /// The requested template name.
        name: String,
    },
}

/// Errors that can occur while parsing durations, table names, or
/// configuration files.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// A duration string could not be parsed.
    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration {
        /// The text that failed to parse.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    /// A discovered table name does not follow the `flows[_<duration>]`
    /// convention.
    #[error("table '{name}' does not follow the flow table naming convention: {reason}")]
    InvalidTableName {
        /// The offending table name.
        name: String,
        /// Why it is invalid.
        reason: String,
    },

    /// A resolution layout entry is invalid.
    #[error("invalid resolution configuration: {reason}")]
    InvalidResolution {
        /// Description of what makes the layout invalid.
        reason: String,
    },

    /// A scalar configuration value is invalid.
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue {
        /// The configuration field.
        field: String,
        /// Why it is invalid.
        reason: String,
    },

    /// A named template is malformed.
    #[error("template '{name}' is invalid: {source}")]
    InvalidTemplate {
        /// The template name.
        name: String,
        /// The scanner error.
        #[source]
        source: TemplateError,
    },

    /// The configuration file could not be read.
    #[error("failed to read configuration '{}': {source}", path.display())]
    Read {
        /// The configuration path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse configuration '{}': {source}", path.display())]
    Parse {
        /// The configuration path.
        path: PathBuf,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Type alias for `Result<T, FlowplanError>`.
pub type Result<T> = std::result::Result<T, FlowplanError>;
