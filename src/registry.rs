//! The registry owns the running backend sessions.
//!
//! The registry reconciles its sessions against a configuration document:
//! backends that became enabled are started, backends whose launch config
//! changed are restarted, and backends that were disabled or removed are
//! stopped. All status lives in the [`StateStore`]; the registry only holds
//! session handles.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::validate::validate_document;
use crate::config::{BackendConfig, ConfigDocument};
use crate::error::HubError;
use crate::namespace::AggregatedTool;
use crate::session::stdio::spawn_backend_session;
use crate::session::{Backoff, SessionHandle};
use crate::state::{BackendStatus, StatePatch, StateStore};

struct RunningBackend {
    config: BackendConfig,
    handle: SessionHandle,
}

/// What one `apply_document` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub started: Vec<String>,
    pub stopped: Vec<String>,
    pub removed: Vec<String>,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.removed.is_empty()
    }
}

/// The single entry point for running backends.
pub struct BackendRegistry {
    store: StateStore,
    sessions: Mutex<HashMap<String, RunningBackend>>,
    backoff: Backoff,
    /// Root cancellation token; cancelling it shuts down all session tasks.
    cancel: CancellationToken,
}

impl BackendRegistry {
    pub fn new(store: StateStore) -> Self {
        Self::with_backoff(store, Backoff::default())
    }

    pub fn with_backoff(store: StateStore, backoff: Backoff) -> Self {
        Self {
            store,
            sessions: Mutex::new(HashMap::new()),
            backoff,
            cancel: CancellationToken::new(),
        }
    }

    /// Build a registry and start every backend enabled in `document`.
    pub async fn from_document(store: StateStore, document: &ConfigDocument) -> crate::Result<Self> {
        let registry = Self::new(store);
        registry.apply_document(document).await?;
        Ok(registry)
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Reconcile running sessions with `document`.
    ///
    /// An invalid document is rejected before anything is touched.
    pub async fn apply_document(&self, document: &ConfigDocument) -> crate::Result<ReconcileSummary> {
        let report = validate_document(document);
        for warning in &report.warnings {
            tracing::warn!(warning = %warning, "config warning");
        }
        if !report.valid {
            return Err(HubError::InvalidConfig(
                "config".into(),
                report.errors.join("; "),
            ));
        }

        let desired: BTreeMap<&str, &BackendConfig> = document
            .mcp_servers
            .iter()
            .filter(|(name, _)| document.is_enabled(name))
            .map(|(name, config)| (name.as_str(), config))
            .collect();

        let mut summary = ReconcileSummary::default();
        let mut sessions = self.sessions.lock().await;

        let stale: Vec<String> = sessions
            .iter()
            .filter(|(name, running)| {
                desired
                    .get(name.as_str())
                    .is_none_or(|config| **config != running.config)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(running) = sessions.remove(&name) {
                tracing::info!(server = %name, "stopping backend");
                running.handle.shutdown().await;
                summary.stopped.push(name);
            }
        }

        for (name, config) in &desired {
            if sessions.contains_key(*name) {
                continue;
            }
            tracing::info!(server = %name, "starting backend");
            let handle = spawn_backend_session(
                name.to_string(),
                (*config).clone(),
                self.store.clone(),
                self.backoff,
                self.cancel.child_token(),
            );
            sessions.insert(
                name.to_string(),
                RunningBackend {
                    config: (*config).clone(),
                    handle,
                },
            );
            summary.started.push(name.to_string());
        }
        drop(sessions);

        // Configured but not running: keep a disabled entry carrying the
        // config, and no tools.
        for (name, config) in &document.mcp_servers {
            if desired.contains_key(name.as_str()) {
                continue;
            }
            self.store.delete_server_tools(name).await;
            let patch = StatePatch::status(BackendStatus::Disabled).with_config(config.clone());
            if let Err(e) = self.store.update_server_state(name, patch, true).await {
                tracing::warn!(server = %name, error = %e, "failed to record disabled backend");
            }
        }

        // No longer configured at all: forget it.
        for name in self.store.server_names().await {
            if !document.mcp_servers.contains_key(&name) {
                self.store.delete_server_state(&name).await;
                self.store.delete_server_tools(&name).await;
                summary.removed.push(name);
            }
        }

        tracing::info!(
            started = summary.started.len(),
            stopped = summary.stopped.len(),
            removed = summary.removed.len(),
            "config applied"
        );
        Ok(summary)
    }

    /// All tools of all backends, under their aggregated names.
    pub async fn tools(&self) -> Vec<AggregatedTool> {
        self.store.get_all_tools().await
    }

    /// Re-discover the tools of a running backend.
    pub async fn refresh(&self, name: &str) -> crate::Result<usize> {
        let sessions = self.sessions.lock().await;
        let running = sessions.get(name).ok_or_else(|| {
            HubError::Transport(name.to_string(), "backend is not running".to_string())
        })?;
        running.handle.refresh().await
    }

    /// Sorted names of backends with a running session.
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Stop every session, then wait for pending snapshot writes.
    pub async fn shutdown(&self) {
        tracing::info!("registry shutting down all backends");
        self.cancel.cancel();
        let drained: Vec<(String, RunningBackend)> =
            self.sessions.lock().await.drain().collect();
        for (_, running) in drained {
            running.handle.shutdown().await;
        }
        self.store.flush().await;
    }
}
