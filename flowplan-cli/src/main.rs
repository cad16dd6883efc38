//! CLI for the flowplan flow table registry and query planner.
//!
//! Provides commands for inspecting flow tables, rendering query templates,
//! checking configuration, and keeping a snapshot fresh.

mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use flowplan::clickhouse::ClickHouseStore;
use flowplan::resolution::{format_resolution, parse_resolution};
use flowplan::{FlowplanConfig, Registry, Snapshot};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::watch::WatchOptions;

/// flowplan: flow table registry and query planner CLI.
#[derive(Parser)]
#[command(name = "flowplan", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where the table list comes from.
#[derive(Args)]
struct Source {
    /// Configuration file (JSON). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read tables from a snapshot file instead of querying ClickHouse.
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List the flow tables and how far back each one reaches.
    Tables {
        #[command(flatten)]
        source: Source,

        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Render a query template against the best table.
    Render {
        #[command(flatten)]
        source: Source,

        /// Template text, or `@name` for a template from the configuration.
        #[arg(long)]
        template: String,

        /// Start of the window (RFC 3339). Defaults to `--range` before the end.
        #[arg(long)]
        start: Option<String>,

        /// End of the window (RFC 3339). Defaults to now.
        #[arg(long)]
        end: Option<String>,

        /// Window length when `--start` is not given (e.g., "1h", "30m", "7d", "1d12h").
        #[arg(long, default_value = "1h")]
        range: String,

        /// Coarsest acceptable resolution, in the same format as `--range` (e.g., "0s", "1m0s", "5m").
        #[arg(long, default_value = "0s")]
        resolution: String,

        /// Print the plan as JSON along with the query.
        #[arg(long)]
        explain: bool,
    },

    /// Validate a configuration file and report missing tables.
    Check {
        /// Configuration file (JSON).
        config: PathBuf,

        /// Compare against a snapshot file instead of querying ClickHouse.
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Only validate the file; do not look at any tables.
        #[arg(long)]
        offline: bool,
    },

    /// Refresh the table list periodically until interrupted.
    Watch {
        /// Configuration file (JSON). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Write every published snapshot to this file.
        #[arg(long)]
        dump: Option<PathBuf>,
    },
}

/// Output format for table listings.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON snapshot.
    Json,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Tables { source, format } => cmd_tables(&source, &format),
        Commands::Render {
            source,
            template,
            start,
            end,
            range,
            resolution,
            explain,
        } => cmd_render(
            &source,
            &template,
            start.as_deref(),
            end.as_deref(),
            &range,
            &resolution,
            explain,
        ),
        Commands::Check {
            config,
            snapshot,
            offline,
        } => cmd_check(&config, snapshot.as_deref(), offline),
        Commands::Watch { config, dump } => cmd_watch(config.as_deref(), dump),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Implements `flowplan tables`.
fn cmd_tables(source: &Source, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(source.config.as_deref())?;
    let registry = load_registry(&config, source.snapshot.as_deref())?;
    let snapshot = registry.snapshot();

    match format {
        OutputFormat::Csv => {
            println!("# version={}, tables={}", snapshot.version(), snapshot.tables().len());
            println!("name,resolution,oldest");
            for table in snapshot.tables() {
                println!(
                    "{},{},{}",
                    table.name,
                    format_resolution(table.resolution),
                    table.oldest.to_rfc3339()
                );
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&*snapshot)?);
        }
    }

    Ok(())
}

/// Implements `flowplan render`.
fn cmd_render(
    source: &Source,
    template: &str,
    start: Option<&str>,
    end: Option<&str>,
    range: &str,
    resolution: &str,
    explain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(source.config.as_deref())?;
    let template = match template.strip_prefix('@') {
        Some(name) => config.template(name)?.to_string(),
        None => template.to_string(),
    };
    let resolution = parse_resolution(resolution)?;

    let end = match end {
        Some(text) => parse_instant(text)?,
        None => Utc::now(),
    };
    let start = match start {
        Some(text) => parse_instant(text)?,
        None => window_start(end, range)?,
    };

    let registry = load_registry(&config, source.snapshot.as_deref())?;
    let plan = registry.plan(start, end, resolution);
    if plan.may_be_incomplete() {
        tracing::warn!(table = plan.table(), "no table covers the requested start, results may be incomplete");
    }
    let sql = plan.render(&template)?;

    if explain {
        let (rounded_start, rounded_end) = plan.bounds();
        let output = serde_json::json!({
            "table": plan.table(),
            "resolution": format_resolution(plan.resolution()),
            "start": rounded_start.to_rfc3339(),
            "end": rounded_end.to_rfc3339(),
            "may_be_incomplete": plan.may_be_incomplete(),
            "fallback": plan.is_fallback(),
            "query": sql,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{sql}");
    }

    Ok(())
}

/// Implements `flowplan check <config>`.
fn cmd_check(
    config_path: &Path,
    snapshot: Option<&Path>,
    offline: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = FlowplanConfig::load(config_path)?;

    println!("Configuration: {}", config_path.display());
    println!("  ClickHouse: {} (database {})", config.clickhouse.endpoint, config.clickhouse.database);
    println!("  Refresh interval: {}", format_resolution(config.refresh_interval));
    println!("  Resolutions: {}", config.resolutions.len());
    for resolution in &config.resolutions {
        println!(
            "    {}: ttl={}",
            resolution.table_name(),
            format_duration_secs(resolution.ttl.as_secs())
        );
    }
    println!("  Templates: {}", config.templates.len());
    for name in config.templates.keys() {
        println!("    @{name}");
    }

    if offline {
        return Ok(());
    }

    let registry = load_registry(&config, snapshot)?;
    let missing = config.missing_tables(&registry.snapshot());
    println!();
    if missing.is_empty() {
        println!("All configured tables present.");
    } else {
        return Err(format!("Missing tables: {}", missing.join(", ")).into());
    }

    Ok(())
}

/// Implements `flowplan watch`.
fn cmd_watch(config: Option<&Path>, dump: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    let store = Arc::new(ClickHouseStore::new(config.clickhouse.clone())?);
    let registry = Arc::new(Registry::new());
    let cancel = CancellationToken::new();
    let options = WatchOptions {
        interval: config.refresh_interval,
        dump,
        config,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, stopping");
            }
            interrupt.cancel();
        });

        watch::run(registry, store, options, cancel).await;
    });

    Ok(())
}

fn load_config(path: Option<&Path>) -> flowplan::Result<FlowplanConfig> {
    match path {
        Some(path) => FlowplanConfig::load(path),
        None => Ok(FlowplanConfig::default()),
    }
}

/// Builds a registry from a snapshot file, or from one ClickHouse refresh.
fn load_registry(config: &FlowplanConfig, snapshot: Option<&Path>) -> Result<Registry, Box<dyn std::error::Error>> {
    if let Some(path) = snapshot {
        let data = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read snapshot '{}': {e}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&data)?;
        return Ok(Registry::with_snapshot(snapshot));
    }

    let store = ClickHouseStore::new(config.clickhouse.clone())?;
    let registry = Registry::new();
    registry.refresh(&store, &CancellationToken::new())?;
    Ok(registry)
}

/// Parses an RFC 3339 timestamp into UTC.
fn parse_instant(s: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    let instant = DateTime::parse_from_rfc3339(s.trim())
        .map_err(|e| format!("Invalid timestamp '{s}': {e}"))?;
    Ok(instant.with_timezone(&Utc))
}

/// Returns the instant `range` before `end`.
///
/// `range` uses the same duration text as `--resolution`.
fn window_start(end: DateTime<Utc>, range: &str) -> Result<DateTime<Utc>, Box<dyn std::error::Error>> {
    let length = parse_resolution(range.trim())?;
    let start = chrono::Duration::from_std(length)
        .ok()
        .and_then(|delta| end.checked_sub_signed(delta))
        .ok_or_else(|| format!("Range '{range}' reaches past the earliest representable time"))?;
    Ok(start)
}

/// Formats seconds as a human-readable duration.
fn format_duration_secs(secs: u64) -> String {
    if secs >= 86400 && secs.is_multiple_of(86400) {
        format!("{}d", secs / 86400)
    } else if secs >= 3600 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_start() {
        let end = parse_instant("2022-04-10T15:45:10Z").unwrap();
        assert_eq!(
            window_start(end, "90s").unwrap().to_rfc3339(),
            "2022-04-10T15:44:40+00:00"
        );
        assert_eq!(
            window_start(end, "7d").unwrap().to_rfc3339(),
            "2022-04-03T15:45:10+00:00"
        );
        assert_eq!(
            window_start(end, "1h30m").unwrap().to_rfc3339(),
            "2022-04-10T14:15:10+00:00"
        );
        assert!(window_start(end, "").is_err());
        assert!(window_start(end, "1w").is_err());
        assert!(window_start(end, "h").is_err());
    }

    #[test]
    fn test_window_start_rejects_huge_ranges() {
        let end = parse_instant("2022-04-10T15:45:10Z").unwrap();
        for range in ["100000000000d", "300000000000000000d", "99999999999999999999h"] {
            assert!(window_start(end, range).is_err(), "{range} was accepted");
        }

        let earliest = DateTime::<Utc>::MIN_UTC + chrono::Duration::seconds(1);
        let err = window_start(earliest, "2s").unwrap_err();
        assert!(err.to_string().contains("earliest representable time"));
    }

    #[test]
    fn test_parse_instant() {
        let instant = parse_instant("2022-04-10T17:45:10+02:00").unwrap();
        assert_eq!(instant.to_rfc3339(), "2022-04-10T15:45:10+00:00");
        assert!(parse_instant("yesterday").is_err());
    }

    #[test]
    fn test_format_duration_secs() {
        assert_eq!(format_duration_secs(15 * 86400), "15d");
        assert_eq!(format_duration_secs(7200), "2h");
        assert_eq!(format_duration_secs(300), "5m");
        assert_eq!(format_duration_secs(90), "90s");
    }

    #[test]
    fn test_cli_parses_render() {
        let cli = Cli::try_parse_from([
            "flowplan",
            "render",
            "--snapshot",
            "snap.json",
            "--template",
            "@traffic",
            "--resolution",
            "5m0s",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Render { explain: false, .. }));
    }
}
