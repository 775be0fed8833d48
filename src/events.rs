//! Change notification plumbing.
//!
//! Two separate channels leave the store:
//!
//! - [`Subscribers`]: callbacks registered by collaborators, invoked
//!   synchronously after every committed mutation.
//! - [`Notifier`]: injected at construction, used to alert external
//!   listeners about operational problems (e.g. an unreadable snapshot).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::state::{BackendState, ToolDescriptor};

/// A committed store mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    StateChanged { name: String, state: BackendState },
    ToolsChanged { name: String, tools: Vec<ToolDescriptor> },
    StateDeleted { name: String },
    ToolsDeleted { name: String },
}

impl StoreEvent {
    /// Backend the event is about.
    pub fn server(&self) -> &str {
        match self {
            StoreEvent::StateChanged { name, .. }
            | StoreEvent::ToolsChanged { name, .. }
            | StoreEvent::StateDeleted { name }
            | StoreEvent::ToolsDeleted { name } => name,
        }
    }
}

/// Callback invoked for every [`StoreEvent`]. Must not block.
pub type Subscriber = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Registered subscriber callbacks.
#[derive(Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    entries: RwLock<Vec<(SubscriptionId, Subscriber)>>,
}

impl Subscribers {
    pub fn subscribe(&self, callback: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, callback));
        id
    }

    /// Returns false when `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every subscriber in registration order.
    ///
    /// The registry lock is released before any callback runs, so a callback
    /// may subscribe or unsubscribe.
    pub fn notify(&self, event: &StoreEvent) {
        let callbacks: Vec<Subscriber> = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// An operational alert for external listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            title: title.into(),
            message: message.into(),
        }
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            title: title.into(),
            message: message.into(),
        }
    }
}

/// Sink for operational alerts. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Forwards notices to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => tracing::info!(title = %notice.title, "{}", notice.message),
            NoticeLevel::Warning => tracing::warn!(title = %notice.title, "{}", notice.message),
            NoticeLevel::Error => tracing::error!(title = %notice.title, "{}", notice.message),
        }
    }
}

/// Discards every notice.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notice: Notice) {}
}

/// Keeps notices in memory for assertions.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingNotifier {
    notices: std::sync::Mutex<Vec<Notice>>,
}

#[cfg(test)]
impl RecordingNotifier {
    pub(crate) fn notices(&self) -> Vec<Notice> {
        self.notices.lock().unwrap().clone()
    }
}

#[cfg(test)]
impl Notifier for RecordingNotifier {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}
