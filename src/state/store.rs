//! The authoritative store of backend state and tool catalogs.
//!
//! Mutations for one backend name are serialized through that name's slot
//! lock; different names never wait on each other. Every committed mutation
//! notifies subscribers synchronously and schedules a coalesced write of the
//! affected snapshot files.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::save_queue::{RenderFn, SaveQueue};
use super::slots::Slots;
use super::{snapshot, BackendState, StatePatch, ToolDescriptor};
use crate::config::HubSettings;
use crate::error::HubError;
use crate::events::{Notice, Notifier, StoreEvent, Subscribers, SubscriptionId};
use crate::namespace::{namespace_tool, AggregatedTool};

/// Where the snapshot files live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub state_file: PathBuf,
    pub tools_file: PathBuf,
}

impl StorePaths {
    pub fn from_settings(settings: &HubSettings) -> Self {
        Self {
            state_file: settings.state_file(),
            tools_file: settings.tools_file(),
        }
    }
}

struct StoreInner {
    states: Slots<BackendState>,
    tools: Slots<Vec<ToolDescriptor>>,
    subscribers: Subscribers,
    notifier: Arc<dyn Notifier>,
    queue: SaveQueue,
    paths: Option<StorePaths>,
}

/// Shared handle to the store. Cloning is cheap.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<StoreInner>,
}

impl StateStore {
    /// An empty store. With `paths`, mutations are persisted there.
    pub fn new(paths: Option<StorePaths>, save_interval: Duration, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                states: Slots::new(),
                tools: Slots::new(),
                subscribers: Subscribers::default(),
                notifier,
                queue: SaveQueue::new(save_interval),
                paths,
            }),
        }
    }

    /// A store that never touches the filesystem.
    pub fn in_memory(notifier: Arc<dyn Notifier>) -> Self {
        Self::new(None, Duration::ZERO, notifier)
    }

    /// Build a store from the snapshot files at `paths`.
    ///
    /// Never fails: a missing or unreadable snapshot leaves that half of the
    /// store empty and raises an error notice.
    pub async fn load(paths: StorePaths, save_interval: Duration, notifier: Arc<dyn Notifier>) -> Self {
        let store = Self::new(Some(paths.clone()), save_interval, notifier);

        match snapshot::load_states(&paths.state_file).await {
            Ok(states) => {
                tracing::info!(path = %paths.state_file.display(), count = states.len(), "loaded server state");
                store.inner.states.seed(states).await;
            }
            Err(e) => store.inner.notifier.notify(Notice::error(
                "Server state not loaded",
                format!("starting with empty state: {e}"),
            )),
        }

        match snapshot::load_tools(&paths.tools_file).await {
            Ok(tools) => {
                tracing::info!(path = %paths.tools_file.display(), count = tools.len(), "loaded server tools");
                store.inner.tools.seed(tools).await;
            }
            Err(e) => store.inner.notifier.notify(Notice::error(
                "Server tools not loaded",
                format!("starting with empty tool catalog: {e}"),
            )),
        }

        store
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.inner.notifier.clone()
    }

    /// Merge `patch` into the state for `name` and commit it.
    ///
    /// The merge is computed on a copy. With `atomic`, a result that fails
    /// validation is discarded and the previous value stays in place
    /// untouched. Without it, the result is normalized so it always satisfies
    /// the state invariants.
    pub async fn update_server_state(
        &self,
        name: &str,
        patch: StatePatch,
        atomic: bool,
    ) -> crate::Result<BackendState> {
        check_name(name)?;
        let mut slot = self.inner.states.lock(name).await;

        let mut next = (*slot).clone().unwrap_or_default();
        patch.apply_to(&mut next);
        next.last_update = Some(Utc::now());

        if atomic {
            if let Err(e) = next.validate(name) {
                tracing::warn!(server = %name, error = %e, "rejected state update");
                return Err(e);
            }
        } else {
            next.normalize();
        }

        *slot = Some(next.clone());
        tracing::debug!(server = %name, status = %next.status, "state committed");
        self.persist_states();
        self.inner.subscribers.notify(&StoreEvent::StateChanged {
            name: name.to_string(),
            state: next.clone(),
        });
        Ok(next)
    }

    /// Replace the tool list of `name`.
    pub async fn update_server_tools(
        &self,
        name: &str,
        tools: Vec<ToolDescriptor>,
    ) -> crate::Result<()> {
        check_name(name)?;
        if tools.iter().any(|tool| tool.name.trim().is_empty()) {
            return Err(HubError::Validation(
                name.to_string(),
                "tool names must not be empty".to_string(),
            ));
        }
        let tools: Vec<ToolDescriptor> = tools
            .into_iter()
            .map(|mut tool| {
                tool.server = name.to_string();
                tool
            })
            .collect();

        let mut slot = self.inner.tools.lock(name).await;
        *slot = Some(tools.clone());
        tracing::debug!(server = %name, count = tools.len(), "tools committed");
        self.persist_tools();
        self.persist_states();
        self.inner.subscribers.notify(&StoreEvent::ToolsChanged {
            name: name.to_string(),
            tools,
        });
        Ok(())
    }

    /// Every tool of every backend under its aggregated name, sorted by
    /// backend and then tool name.
    ///
    /// Backend names may contain underscores, so two different tools can map
    /// to the same aggregated name. The first one wins and the rest are
    /// dropped with a warning.
    pub async fn get_all_tools(&self) -> Vec<AggregatedTool> {
        let catalogs = self.inner.tools.snapshot().await;
        let mut seen = HashSet::new();
        let mut out = Vec::new();

        for (server, mut tools) in catalogs {
            tools.sort_by(|a, b| a.name.cmp(&b.name));
            for tool in &tools {
                let aggregated = namespace_tool(&server, tool);
                if !seen.insert(aggregated.name.clone()) {
                    tracing::warn!(
                        server = %server,
                        tool = %tool.name,
                        name = %aggregated.name,
                        "aggregated tool name collides with another backend, skipping"
                    );
                    continue;
                }
                out.push(aggregated);
            }
        }
        out
    }

    /// Remove the state of `name`. Returns whether it existed.
    pub async fn delete_server_state(&self, name: &str) -> bool {
        let existed = self.inner.states.remove(name).await.is_some();
        if existed {
            tracing::debug!(server = %name, "state deleted");
            self.persist_states();
            self.inner.subscribers.notify(&StoreEvent::StateDeleted {
                name: name.to_string(),
            });
        }
        existed
    }

    /// Remove the tool list of `name`. Returns whether it existed.
    pub async fn delete_server_tools(&self, name: &str) -> bool {
        let existed = self.inner.tools.remove(name).await.is_some();
        if existed {
            tracing::debug!(server = %name, "tools deleted");
            self.persist_tools();
            self.persist_states();
            self.inner.subscribers.notify(&StoreEvent::ToolsDeleted {
                name: name.to_string(),
            });
        }
        existed
    }

    pub async fn server_state(&self, name: &str) -> Option<BackendState> {
        self.inner.states.get(name).await
    }

    pub async fn all_server_states(&self) -> BTreeMap<String, BackendState> {
        self.inner.states.snapshot().await
    }

    pub async fn server_tools(&self, name: &str) -> Option<Vec<ToolDescriptor>> {
        self.inner.tools.get(name).await
    }

    /// Names with a state entry, sorted.
    pub async fn server_names(&self) -> Vec<String> {
        self.inner.states.snapshot().await.into_keys().collect()
    }

    /// Register a callback for every committed mutation.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.inner.subscribers.subscribe(Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.subscribers.unsubscribe(id)
    }

    /// Wait until every scheduled snapshot write has been attempted.
    pub async fn flush(&self) {
        self.inner.queue.flush().await;
    }

    fn persist_states(&self) {
        let Some(paths) = &self.inner.paths else {
            return;
        };
        let store = self.clone();
        let render: RenderFn = Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let states = store.inner.states.snapshot().await;
                let tools = store.inner.tools.snapshot().await;
                snapshot::render_states(&states, &tools)
            })
        });
        self.inner.queue.schedule(paths.state_file.clone(), render);
    }

    fn persist_tools(&self) {
        let Some(paths) = &self.inner.paths else {
            return;
        };
        let store = self.clone();
        let render: RenderFn = Arc::new(move || {
            let store = store.clone();
            Box::pin(async move {
                let tools = store.inner.tools.snapshot().await;
                snapshot::render_tools(&tools)
            })
        });
        self.inner.queue.schedule(paths.tools_file.clone(), render);
    }
}

fn check_name(name: &str) -> crate::Result<()> {
    if name.trim().is_empty() {
        return Err(HubError::Validation(
            name.to_string(),
            "server name must not be empty".to_string(),
        ));
    }
    Ok(())
}
