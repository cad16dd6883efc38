//! Periodic registry refresh for `flowplan watch`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use flowplan::{FlowStore, FlowplanConfig, Registry, Snapshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Settings for the refresh loop.
pub struct WatchOptions {
    /// Time between refreshes.
    pub interval: Duration,
    /// Where to write each published snapshot, if anywhere.
    pub dump: Option<PathBuf>,
    /// Used to report tables the layout expects but discovery did not find.
    pub config: FlowplanConfig,
}

/// Refreshes `registry` from `store` every `options.interval` until `cancel`
/// fires.
///
/// The first refresh runs immediately. A failed refresh is logged and the
/// previous snapshot keeps serving until the next tick. Cancelling aborts an
/// in-flight refresh before its next store request, or during a retry
/// backoff.
pub async fn run<S>(
    registry: Arc<Registry>,
    store: Arc<S>,
    options: WatchOptions,
    cancel: CancellationToken,
) where
    S: FlowStore + 'static,
{
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let task_registry = Arc::clone(&registry);
        let task_store = Arc::clone(&store);
        let task_cancel = cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            task_registry.refresh(&*task_store, &task_cancel)
        })
        .await;

        match outcome {
            Ok(Ok(snapshot)) => {
                let missing = options.config.missing_tables(&snapshot);
                if !missing.is_empty() {
                    tracing::warn!(?missing, "configured flow tables not found");
                }
                if let Some(path) = &options.dump
                    && let Err(e) = write_snapshot(path, &snapshot)
                {
                    tracing::warn!(path = %path.display(), error = %e, "failed to write snapshot");
                }
            }
            Ok(Err(e)) if e.is_cancelled() => break,
            Ok(Err(_)) => {
                // Already logged by the registry; retry on the next tick.
            }
            Err(e) => {
                tracing::error!(error = %e, "refresh task failed");
            }
        }
    }

    tracing::info!(version = registry.snapshot().version(), "watch stopped");
}

/// Writes `snapshot` as JSON, replacing `path` atomically.
fn write_snapshot(path: &Path, snapshot: &Snapshot) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)
}
