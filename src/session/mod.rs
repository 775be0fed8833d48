//! Backend session lifecycle.
//!
//! [`SessionMachine`] owns the legal status transitions of one backend:
//!
//! ```text
//! disabled -> updating -> connected
//!                |  ^        |
//!                v  |        v
//!               error     updating (refresh / reconnect)
//! any -> disabled
//! ```
//!
//! The driver in [`stdio`] feeds it events and commits each resulting patch
//! through the state store.

pub mod stdio;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HubError;
use crate::state::{BackendStatus, StatePatch, StateStore};

/// Something that happened to a backend session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Start a disabled backend.
    Activate,
    /// Handshake and tool discovery succeeded.
    Connected,
    /// The attempt in progress failed.
    Failed { message: String },
    /// Re-discover tools of a connected backend, or reconnect after it dropped.
    Refresh,
    /// Try again after a failure.
    Retry,
    /// Stop the backend.
    Deactivate,
}

impl SessionEvent {
    fn target(&self) -> BackendStatus {
        match self {
            SessionEvent::Activate | SessionEvent::Refresh | SessionEvent::Retry => {
                BackendStatus::Updating
            }
            SessionEvent::Connected => BackendStatus::Connected,
            SessionEvent::Failed { .. } => BackendStatus::Error,
            SessionEvent::Deactivate => BackendStatus::Disabled,
        }
    }
}

/// Status machine for one backend.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    name: String,
    status: BackendStatus,
}

impl SessionMachine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: BackendStatus::Disabled,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> BackendStatus {
        self.status
    }

    /// Whether `event` is legal from the current status.
    pub fn allows(&self, event: &SessionEvent) -> bool {
        use BackendStatus::*;
        match (self.status, event) {
            (_, SessionEvent::Deactivate) => true,
            (Disabled, SessionEvent::Activate) => true,
            (Updating, SessionEvent::Connected) => true,
            (Updating, SessionEvent::Failed { .. }) => true,
            (Connected, SessionEvent::Refresh) => true,
            (Error, SessionEvent::Retry) => true,
            _ => false,
        }
    }

    /// Apply `event` and return the patch to commit for it.
    pub fn apply(&mut self, event: SessionEvent) -> crate::Result<StatePatch> {
        let target = event.target();
        if !self.allows(&event) {
            return Err(HubError::InvalidTransition {
                name: self.name.clone(),
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        let patch = match event {
            SessionEvent::Failed { message } => {
                if message.trim().is_empty() {
                    return Err(HubError::Validation(
                        self.name.clone(),
                        "failure requires a message".to_string(),
                    ));
                }
                StatePatch::failed(message)
            }
            _ => StatePatch::status(target),
        };
        self.status = target;
        Ok(patch)
    }
}

/// Control messages for a running session.
pub enum SessionCommand {
    /// Re-run tool discovery; replies with the new tool count.
    Refresh {
        response_tx: oneshot::Sender<crate::Result<usize>>,
    },
}

/// External-facing handle for a managed backend session.
pub struct SessionHandle {
    pub name: String,
    pub status_rx: watch::Receiver<BackendStatus>,
    command_tx: mpsc::Sender<SessionCommand>,
    cancel: CancellationToken,
    task: JoinHandle<SessionMachine>,
    store: StateStore,
}

impl SessionHandle {
    /// Re-discover the backend's tools. Fails unless the session is connected.
    pub async fn refresh(&self) -> crate::Result<usize> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SessionCommand::Refresh { response_tx })
            .await
            .map_err(|_| HubError::ShuttingDown(self.name.clone()))?;
        response_rx
            .await
            .map_err(|_| HubError::ShuttingDown(self.name.clone()))?
    }

    /// Stop the session, kill its process and mark the backend disabled.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let mut machine = match self.task.await {
            Ok(machine) => machine,
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "session task ended abnormally");
                SessionMachine::new(self.name.clone())
            }
        };

        match machine.apply(SessionEvent::Deactivate) {
            Ok(patch) => {
                if let Err(e) = self.store.update_server_state(&self.name, patch, true).await {
                    tracing::warn!(server = %self.name, error = %e, "failed to record deactivation");
                }
            }
            Err(e) => tracing::warn!(server = %self.name, error = %e, "deactivation rejected"),
        }
        self.store.delete_server_tools(&self.name).await;
        tracing::info!(server = %self.name, "session stopped");
    }
}

/// Backoff schedule between restart attempts.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    /// Consecutive failures after which the session gives up and stays in error.
    pub max_failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_failures: 5,
        }
    }
}

impl Backoff {
    pub fn next(&self, current: Duration) -> Duration {
        std::cmp::min(current * 2, self.max)
    }
}
