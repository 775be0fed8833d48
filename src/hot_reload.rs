//! Hot-reload for `mcphub run`.
//!
//! Watches the configuration document using the `notify` crate. On each
//! detected change (with 100ms debounce), it re-runs the load pipeline
//! (read, migrate, repair, validate) and applies the result to the registry.
//! On failure, the running configuration is kept and a warning is logged.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::RecursiveMode;
use notify::Watcher;
use tokio_util::sync::CancellationToken;

use crate::config::validate::validate_document;
use crate::config::{load_document, ConfigDocument};
use crate::error::HubError;
use crate::registry::{BackendRegistry, ReconcileSummary};

const DEBOUNCE: Duration = Duration::from_millis(100);

/// Watch `config_path` for changes and re-apply it to `registry` on each change.
///
/// Returns when `cancel` fires or the watcher cannot be set up.
pub async fn run_hot_reload(
    config_path: PathBuf,
    registry: Arc<BackendRegistry>,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    // notify v8's EventHandler is implemented for FnMut, tokio's
    // UnboundedSender is not.
    let mut watcher = match notify::recommended_watcher(move |event| {
        let _ = tx.send(event);
    }) {
        Ok(w) => w,
        Err(e) => {
            tracing::error!(error = %e, "failed to create file watcher for hot-reload");
            return;
        }
    };

    // Editors often replace the file instead of writing it in place, so watch
    // the parent directory and filter by path.
    let watch_target = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = watcher.watch(&watch_target, RecursiveMode::NonRecursive) {
        tracing::error!(
            path = %watch_target.display(),
            error = %e,
            "failed to watch config directory for hot-reload"
        );
        return;
    }

    // The OS-level watch stops when the watcher is dropped.
    let _watcher = watcher;

    tracing::info!(path = %config_path.display(), "hot-reload watching config file");

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(Ok(event)) => {
                        if !touches(&event, &config_path) {
                            continue;
                        }
                        tokio::time::sleep(DEBOUNCE).await;
                        while rx.try_recv().is_ok() {}

                        match reload(&config_path, &registry).await {
                            Ok(summary) => tracing::info!(
                                path = %config_path.display(),
                                started = summary.started.len(),
                                stopped = summary.stopped.len(),
                                removed = summary.removed.len(),
                                "config reloaded"
                            ),
                            Err(e) => tracing::warn!(
                                error = %e,
                                path = %config_path.display(),
                                "hot-reload failed, keeping previous config"
                            ),
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "file watcher error during hot-reload");
                    }
                    None => {
                        tracing::debug!("hot-reload watcher channel closed");
                        return;
                    }
                }
            }
            _ = cancel.cancelled() => {
                tracing::debug!("hot-reload cancelled");
                return;
            }
        }
    }
}

fn touches(event: &notify::Event, config_path: &Path) -> bool {
    let file_name = config_path.file_name();
    event
        .paths
        .iter()
        .any(|path| path == config_path || (file_name.is_some() && path.file_name() == file_name))
}

/// Load the document at `config_path`, refusing anything that should not
/// replace a running configuration.
///
/// Structural problems that repair fixed are logged, not refused; the
/// repaired document must still validate.
pub async fn load_for_apply(config_path: &Path) -> crate::Result<ConfigDocument> {
    let loaded = load_document(config_path).await?;
    if !loaded.migration.is_complete() {
        return Err(HubError::MigrationGap(
            loaded.migration.from.clone(),
            loaded.migration.to.clone(),
        ));
    }
    let report = validate_document(&loaded.document);
    if !report.valid {
        return Err(HubError::InvalidConfig(
            config_path.display().to_string(),
            report.errors.join("; "),
        ));
    }
    for change in &loaded.changes {
        tracing::info!(change = %change, "config repaired");
    }
    Ok(loaded.document)
}

async fn reload(config_path: &Path, registry: &BackendRegistry) -> crate::Result<ReconcileSummary> {
    let document = load_for_apply(config_path).await?;
    registry.apply_document(&document).await
}
