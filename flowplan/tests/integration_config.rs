//! Integration tests for loading configuration files.

use chrono::{TimeZone, Utc};
use flowplan::error::{ConfigurationError, TemplateError};
use flowplan::{FlowplanConfig, FlowplanError, Registry, RollupTable};
use std::fs;
use std::time::Duration;
use tempfile::tempdir;

const CONFIG: &str = r#"{
  "clickhouse": {
    "endpoint": "https://clickhouse.example.net:8443",
    "database": "flows",
    "username": "console",
    "password": "secret",
    "timeout": "5s",
    "max_retries": 1,
    "retry_backoff": "250ms"
  },
  "refresh_interval": "30s",
  "resolutions": [
    { "interval": "0s", "ttl": "360h0m0s" },
    { "interval": "1m0s", "ttl": "168h0m0s" },
    { "interval": "5m0s", "ttl": "2160h0m0s" }
  ],
  "templates": {
    "traffic": "SELECT toStartOfInterval(TimeReceived, INTERVAL {resolution->864} second) AS t, SUM(Bytes) FROM {table} WHERE {timefilter} GROUP BY t",
    "ports": "SELECT SrcPort FROM {table} WHERE {timefilter}"
  }
}"#;

#[test]
fn test_load_and_render_named_template() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flowplan.json");
    fs::write(&path, CONFIG).unwrap();

    let config = FlowplanConfig::load(&path).unwrap();
    assert_eq!(config.clickhouse.database, "flows");
    assert_eq!(config.clickhouse.timeout, Duration::from_secs(5));
    assert_eq!(config.clickhouse.retry_backoff, Duration::from_millis(250));
    assert_eq!(config.refresh_interval, Duration::from_secs(30));
    assert_eq!(
        config.expected_tables(),
        vec!["flows", "flows_1m0s", "flows_5m0s"]
    );

    let oldest = Utc.with_ymd_and_hms(2022, 3, 1, 0, 0, 0).unwrap();
    let registry = Registry::with_tables(vec![
        RollupTable::new("flows", Duration::ZERO, oldest),
        RollupTable::new("flows_5m0s", Duration::from_secs(300), oldest),
    ]);
    assert_eq!(config.missing_tables(&registry.snapshot()), vec!["flows_1m0s"]);

    let start = Utc.with_ymd_and_hms(2022, 4, 10, 15, 45, 10).unwrap();
    let end = Utc.with_ymd_and_hms(2022, 4, 11, 15, 45, 10).unwrap();
    let sql = registry
        .render(config.template("traffic").unwrap(), start, end, Duration::from_secs(900))
        .unwrap();
    assert_eq!(
        sql,
        "SELECT toStartOfInterval(TimeReceived, INTERVAL 600 second) AS t, SUM(Bytes) FROM flows_5m0s \
         WHERE TimeReceived BETWEEN toDateTime('2022-04-10 15:45:00', 'UTC') AND toDateTime('2022-04-11 15:45:00', 'UTC') \
         GROUP BY t"
    );
}

#[test]
fn test_load_missing_file() {
    let dir = tempdir().unwrap();
    let err = FlowplanConfig::load(dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(
        err,
        FlowplanError::Configuration(ConfigurationError::Read { .. })
    ));
}

#[test]
fn test_load_malformed_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flowplan.json");
    fs::write(&path, "{ \"refresh_interval\": ").unwrap();

    let err = FlowplanConfig::load(&path).unwrap_err();
    assert!(matches!(
        err,
        FlowplanError::Configuration(ConfigurationError::Parse { .. })
    ));
    assert!(err.to_string().contains("flowplan.json"));
}

#[test]
fn test_load_rejects_broken_template() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flowplan.json");
    fs::write(
        &path,
        r#"{ "templates": { "buckets": "SELECT {resolution->lots} FROM {table}" } }"#,
    )
    .unwrap();

    let err = FlowplanConfig::load(&path).unwrap_err();
    match err {
        FlowplanError::Configuration(ConfigurationError::InvalidTemplate { name, source }) => {
            assert_eq!(name, "buckets");
            assert!(matches!(source, TemplateError::InvalidBucket { offset: 7, .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_load_rejects_bad_layout() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flowplan.json");
    fs::write(
        &path,
        r#"{ "resolutions": [ { "interval": "1m0s", "ttl": "24h" } ] }"#,
    )
    .unwrap();

    let err = FlowplanConfig::load(&path).unwrap_err();
    assert!(matches!(
        err,
        FlowplanError::Configuration(ConfigurationError::InvalidResolution { .. })
    ));
}

#[test]
fn test_unknown_template_name() {
    let config = FlowplanConfig::default();
    let err = config.template("nope").unwrap_err();
    assert!(matches!(
        err,
        FlowplanError::Template(TemplateError::UnknownTemplate { .. })
    ));
}
