//! STDIO backend sessions.
//!
//! Key design decisions:
//! - Uses raw `tokio::process::Command` instead of `TokioChildProcess` to enable
//!   noisy-backend stdout filtering (non-JSON lines discarded silently).
//! - Stdout is piped through a BufReader task that filters non-JSON lines before
//!   passing valid JSON to the rmcp transport.
//! - A restart loop with exponential backoff (1s → 30s cap) handles crashed backends.
//! - Every status change is committed through the state store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rmcp::service::RunningService;
use rmcp::{RoleClient, ServiceExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_util::sync::CancellationToken;

use super::{Backoff, SessionCommand, SessionEvent, SessionHandle, SessionMachine};
use crate::config::{resolve_env_vars, BackendConfig};
use crate::error::HubError;
use crate::state::{BackendStatus, StatePatch, StateStore, ToolDescriptor};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Stderr lines kept per backend.
const STDERR_CAPACITY: usize = 100;

/// Stderr lines attached to a failure as `errorDetails`.
const STDERR_DETAIL_LINES: usize = 10;

/// Rolling buffer for per-backend stderr output, for diagnostics.
pub struct StderrBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity,
        }
    }

    /// Push a new stderr line, evicting the oldest if at capacity.
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> &VecDeque<String> {
        &self.lines
    }

    /// The last `n` lines joined with newlines.
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Spawn the child process for a backend.
///
/// Returns the `Child` with stdin, stdout, and stderr all piped. The child is
/// killed if its handle is dropped.
fn spawn_backend_child(name: &str, config: &BackendConfig) -> crate::Result<Child> {
    if config.command.trim().is_empty() {
        return Err(HubError::InvalidConfig(
            name.to_string(),
            "backend requires a 'command'".to_string(),
        ));
    }

    let mut cmd = Command::new(&config.command);

    if !config.args.is_empty() {
        cmd.args(&config.args);
    }

    if !config.env.is_empty() {
        cmd.envs(resolve_env_vars(&config.env));
    }

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.spawn()
        .map_err(|e| HubError::Spawn(name.to_string(), e.to_string()))
}

/// Start a background task that filters stdout from the child process.
///
/// Non-JSON lines are discarded with a debug log. Valid JSON lines are
/// forwarded to the returned reader, which rmcp uses as its transport.
fn start_stdout_filter(
    child_stdout: tokio::process::ChildStdout,
    name: String,
    cancel: CancellationToken,
) -> tokio::io::ReadHalf<tokio::io::DuplexStream> {
    let (client_side, server_side) = tokio::io::duplex(65536);
    let (reader, _client_writer) = tokio::io::split(client_side);
    let (_server_reader, mut writer) = tokio::io::split(server_side);

    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stdout).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            if serde_json::from_str::<serde_json::Value>(&line).is_ok() {
                                let with_newline = format!("{}\n", line);
                                if writer.write_all(with_newline.as_bytes()).await.is_err() {
                                    break;
                                }
                            } else {
                                tracing::debug!(
                                    server = %name,
                                    line = %line,
                                    "discarding non-JSON stdout line"
                                );
                            }
                        }
                        // EOF or read error: dropping the writer signals EOF to rmcp
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });

    reader
}

/// Start a background task that drains stderr from the child process.
fn start_stderr_drain(
    child_stderr: tokio::process::ChildStderr,
    name: String,
    stderr_buf: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(child_stderr).lines();
        loop {
            tokio::select! {
                line_result = lines.next_line() => {
                    match line_result {
                        Ok(Some(line)) => {
                            tracing::debug!(server = %name, line = %line, "backend stderr");
                            stderr_buf.lock().await.push(line);
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    });
}

/// Spawn the child process, start IO filter tasks, and perform the MCP handshake.
async fn spawn_and_handshake(
    name: &str,
    config: &BackendConfig,
    stderr_buf: Arc<Mutex<StderrBuffer>>,
    cancel: CancellationToken,
) -> crate::Result<(RunningService<RoleClient, ()>, Child)> {
    let mut child = spawn_backend_child(name, config)?;

    let child_stdin = child.stdin.take().ok_or_else(|| {
        HubError::Transport(name.to_string(), "failed to open stdin pipe".to_string())
    })?;
    let child_stdout = child.stdout.take().ok_or_else(|| {
        HubError::Transport(name.to_string(), "failed to open stdout pipe".to_string())
    })?;
    let child_stderr = child.stderr.take().ok_or_else(|| {
        HubError::Transport(name.to_string(), "failed to open stderr pipe".to_string())
    })?;

    let filtered_reader = start_stdout_filter(child_stdout, name.to_string(), cancel.clone());
    start_stderr_drain(child_stderr, name.to_string(), stderr_buf, cancel.clone());

    let transport = (filtered_reader, child_stdin);

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, ().serve_with_ct(transport, cancel)).await {
        Err(_elapsed) => Err(HubError::InitializationFailed(
            name.to_string(),
            format!("MCP handshake timed out after {}s", HANDSHAKE_TIMEOUT.as_secs()),
        )),
        Ok(Err(e)) => Err(HubError::InitializationFailed(name.to_string(), e.to_string())),
        Ok(Ok(running)) => Ok((running, child)),
    }
}

async fn discover_tools(
    name: &str,
    peer: &rmcp::Peer<RoleClient>,
) -> crate::Result<Vec<ToolDescriptor>> {
    let tools = peer.list_all_tools().await.map_err(|e| {
        HubError::InitializationFailed(name.to_string(), format!("tool discovery failed: {e}"))
    })?;
    Ok(tools
        .iter()
        .map(|tool| ToolDescriptor::from_mcp(name, tool))
        .collect())
}

/// Per-session state shared by the lifecycle loop.
struct Session {
    machine: SessionMachine,
    config: BackendConfig,
    store: StateStore,
    status_tx: watch::Sender<BackendStatus>,
    stderr_buf: Arc<Mutex<StderrBuffer>>,
}

impl Session {
    fn name(&self) -> &str {
        self.machine.name()
    }

    async fn advance(&mut self, event: SessionEvent) {
        match self.machine.apply(event) {
            Ok(patch) => self.commit(patch).await,
            Err(e) => tracing::warn!(server = %self.name(), error = %e, "transition rejected"),
        }
    }

    /// Move to `error`, recording the failure category and recent stderr.
    /// A failed backend advertises no tools.
    async fn fail(&mut self, error: &HubError) {
        let event = SessionEvent::Failed {
            message: error.to_string(),
        };
        let mut patch = match self.machine.apply(event) {
            Ok(patch) => patch.with_error_type(error.kind()),
            Err(e) => {
                tracing::warn!(server = %self.name(), error = %e, "transition rejected");
                return;
            }
        };
        let details = self.stderr_buf.lock().await.tail(STDERR_DETAIL_LINES);
        if !details.is_empty() {
            patch = patch.with_error_details(details);
        }
        self.store.delete_server_tools(self.machine.name()).await;
        self.commit(patch).await;
    }

    async fn commit(&mut self, mut patch: StatePatch) {
        if patch.status == Some(BackendStatus::Updating) {
            patch = patch.with_config(self.config.clone());
        }
        let name = self.machine.name().to_string();
        if let Err(e) = self.store.update_server_state(&name, patch, true).await {
            tracing::warn!(server = %name, error = %e, "failed to record session status");
        }
        let _ = self.status_tx.send(self.machine.status());
    }

    async fn publish_tools(&self, tools: Vec<ToolDescriptor>) {
        let count = tools.len();
        match self.store.update_server_tools(self.name(), tools).await {
            Ok(()) => tracing::info!(server = %self.name(), tool_count = count, "tools discovered"),
            Err(e) => tracing::warn!(server = %self.name(), error = %e, "failed to record tools"),
        }
    }
}

/// Sleep through a backoff period. Returns false if the session should stop.
///
/// Refresh requests arriving meanwhile are answered with an error.
async fn wait_backoff(
    name: &str,
    delay: Duration,
    commands: &mut mpsc::Receiver<SessionCommand>,
    cancel: &CancellationToken,
) -> bool {
    tracing::info!(server = %name, backoff_ms = delay.as_millis() as u64, "backing off before restart");
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            _ = cancel.cancelled() => {
                tracing::info!(server = %name, "cancelled during backoff sleep");
                return false;
            }
            command = commands.recv() => match command {
                None => return false,
                Some(SessionCommand::Refresh { response_tx }) => {
                    let _ = response_tx.send(Err(HubError::Transport(
                        name.to_string(),
                        "backend is not connected".to_string(),
                    )));
                }
            }
        }
    }
}

/// Main loop that manages the full lifecycle of one backend.
///
/// Returns the final machine when cancelled, when its handle is dropped, or
/// after too many consecutive failures (left in `error`).
async fn run_backend_session(
    mut session: Session,
    backoff_policy: Backoff,
    mut commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
) -> SessionMachine {
    let name = session.name().to_string();
    let mut consecutive_failures: u32 = 0;
    let mut backoff = backoff_policy.initial;

    loop {
        match session.machine.status() {
            BackendStatus::Disabled => session.advance(SessionEvent::Activate).await,
            BackendStatus::Error => session.advance(SessionEvent::Retry).await,
            _ => {}
        }

        tracing::info!(server = %name, command = %session.config.command, "spawning backend");
        let attempt = cancel.child_token();
        let config = session.config.clone();

        let connected = tokio::select! {
            result = spawn_and_handshake(&name, &config, session.stderr_buf.clone(), attempt.clone()) => result,
            _ = cancel.cancelled() => {
                attempt.cancel();
                return session.machine;
            }
        };

        let failure = match connected {
            Err(e) => e,
            Ok((running, mut child)) => {
                // Clone peer before `running.waiting()` consumes it
                let peer: rmcp::Peer<RoleClient> = running.peer().clone();

                match discover_tools(&name, &peer).await {
                    Err(e) => {
                        let _ = child.kill().await;
                        attempt.cancel();
                        e
                    }
                    Ok(tools) => {
                        session.publish_tools(tools).await;
                        session.advance(SessionEvent::Connected).await;
                        consecutive_failures = 0;
                        backoff = backoff_policy.initial;

                        let (exit_tx, mut exit_rx) = oneshot::channel::<()>();
                        tokio::spawn(async move {
                            let _ = running.waiting().await;
                            let _ = exit_tx.send(());
                        });

                        let lost = loop {
                            tokio::select! {
                                command = commands.recv() => match command {
                                    None => {
                                        tracing::info!(server = %name, "session handle dropped, shutting down");
                                        let _ = child.kill().await;
                                        attempt.cancel();
                                        return session.machine;
                                    }
                                    Some(SessionCommand::Refresh { response_tx }) => {
                                        session.advance(SessionEvent::Refresh).await;
                                        match discover_tools(&name, &peer).await {
                                            Ok(tools) => {
                                                let count = tools.len();
                                                session.publish_tools(tools).await;
                                                session.advance(SessionEvent::Connected).await;
                                                let _ = response_tx.send(Ok(count));
                                            }
                                            Err(e) => {
                                                let _ = response_tx.send(Err(e.clone()));
                                                break e;
                                            }
                                        }
                                    }
                                },
                                _ = &mut exit_rx => {
                                    tracing::warn!(server = %name, "backend process exited unexpectedly");
                                    session.advance(SessionEvent::Refresh).await;
                                    break HubError::Transport(
                                        name.clone(),
                                        "process exited unexpectedly".to_string(),
                                    );
                                }
                                _ = cancel.cancelled() => {
                                    tracing::info!(server = %name, "cancellation received, shutting down");
                                    let _ = child.kill().await;
                                    attempt.cancel();
                                    return session.machine;
                                }
                            }
                        };

                        let _ = child.kill().await;
                        attempt.cancel();
                        lost
                    }
                }
            }
        };

        tracing::warn!(server = %name, error = %failure, "backend session failed");
        session.fail(&failure).await;
        consecutive_failures += 1;
        if consecutive_failures >= backoff_policy.max_failures {
            tracing::error!(
                server = %name,
                failures = consecutive_failures,
                "backend exceeded max consecutive failures, giving up"
            );
            return session.machine;
        }

        if !wait_backoff(&name, backoff, &mut commands, &cancel).await {
            return session.machine;
        }
        backoff = backoff_policy.next(backoff);
    }
}

/// Start managing a backend in a background task and return its handle.
pub fn spawn_backend_session(
    name: String,
    config: BackendConfig,
    store: StateStore,
    backoff: Backoff,
    cancel: CancellationToken,
) -> SessionHandle {
    let (status_tx, status_rx) = watch::channel(BackendStatus::Disabled);
    let (command_tx, command_rx) = mpsc::channel(8);

    let session = Session {
        machine: SessionMachine::new(name.clone()),
        config,
        store: store.clone(),
        status_tx,
        stderr_buf: Arc::new(Mutex::new(StderrBuffer::new(STDERR_CAPACITY))),
    };
    let task = tokio::spawn(run_backend_session(
        session,
        backoff,
        command_rx,
        cancel.clone(),
    ));

    SessionHandle {
        name,
        status_rx,
        command_tx,
        cancel,
        task,
        store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopNotifier;

    fn quick_backoff(max_failures: u32) -> Backoff {
        Backoff {
            initial: Duration::from_millis(10),
            max: Duration::from_millis(20),
            max_failures,
        }
    }

    #[test]
    fn test_spawn_backend_child_missing_command() {
        let result = spawn_backend_child("test", &BackendConfig::default());
        assert!(
            matches!(result, Err(HubError::InvalidConfig(name, _)) if name == "test"),
            "Expected InvalidConfig error when command is empty"
        );
    }

    #[tokio::test]
    async fn test_spawn_backend_child_bad_command() {
        let config = BackendConfig::new("/this/command/does/not/exist-mcp-hub");
        let result = spawn_backend_child("test", &config);
        assert!(
            matches!(result, Err(HubError::Spawn(name, _)) if name == "test"),
            "Expected Spawn error for non-existent command"
        );
    }

    #[test]
    fn test_stderr_buffer_capacity_and_tail() {
        let mut buf = StderrBuffer::new(3);
        for line in ["line1", "line2", "line3", "line4"] {
            buf.push(line.to_string());
        }
        assert_eq!(buf.lines().len(), 3);
        assert_eq!(buf.lines().front().unwrap(), "line2");
        assert_eq!(buf.tail(2), "line3\nline4");
        assert_eq!(buf.tail(10), "line2\nline3\nline4");
    }

    #[tokio::test]
    async fn test_spawn_failure_records_error_then_shutdown_disables() {
        let store = StateStore::in_memory(Arc::new(NoopNotifier));
        let backoff = Backoff {
            initial: Duration::from_secs(10),
            ..Backoff::default()
        };
        let handle = spawn_backend_session(
            "broken".to_string(),
            BackendConfig::new("/this/command/does/not/exist-mcp-hub"),
            store.clone(),
            backoff,
            CancellationToken::new(),
        );

        let mut status_rx = handle.status_rx.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|s| *s == BackendStatus::Error),
        )
        .await
        .expect("session should fail")
        .unwrap();

        let state = store.server_state("broken").await.unwrap();
        assert_eq!(state.status, BackendStatus::Error);
        assert_eq!(state.error_type.as_deref(), Some("spawn"));
        assert!(state.error.unwrap().contains("broken"));
        assert_eq!(state.config.command, "/this/command/does/not/exist-mcp-hub");

        let refresh = handle.refresh().await;
        assert!(matches!(refresh, Err(HubError::Transport(..))));

        handle.shutdown().await;
        let state = store.server_state("broken").await.unwrap();
        assert_eq!(state.status, BackendStatus::Disabled);
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn test_spawn_failure_drops_restored_tools() {
        let store = StateStore::in_memory(Arc::new(NoopNotifier));
        store
            .update_server_tools("broken", vec![ToolDescriptor::new("search", "stale")])
            .await
            .unwrap();
        assert_eq!(store.get_all_tools().await.len(), 1);

        let handle = spawn_backend_session(
            "broken".to_string(),
            BackendConfig::new("/this/command/does/not/exist-mcp-hub"),
            store.clone(),
            Backoff {
                initial: Duration::from_secs(10),
                ..Backoff::default()
            },
            CancellationToken::new(),
        );
        let mut status_rx = handle.status_rx.clone();
        tokio::time::timeout(
            Duration::from_secs(5),
            status_rx.wait_for(|s| *s == BackendStatus::Error),
        )
        .await
        .expect("session should fail")
        .unwrap();

        assert!(store.server_tools("broken").await.is_none());
        assert!(store.get_all_tools().await.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_gives_up_after_max_failures() {
        let store = StateStore::in_memory(Arc::new(NoopNotifier));
        let handle = spawn_backend_session(
            "exits".to_string(),
            BackendConfig::new("true"),
            store.clone(),
            quick_backoff(2),
            CancellationToken::new(),
        );

        tokio::time::timeout(Duration::from_secs(10), async {
            while !handle.task.is_finished() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session should give up");

        let state = store.server_state("exits").await.unwrap();
        assert_eq!(state.status, BackendStatus::Error);
        assert_eq!(state.error_type.as_deref(), Some("initialization"));
        assert!(store.server_tools("exits").await.is_none());

        handle.shutdown().await;
        assert_eq!(
            store.server_state("exits").await.unwrap().status,
            BackendStatus::Disabled
        );
    }

    #[cfg(all(test, feature = "integration-tests"))]
    mod integration {
        use super::*;

        #[tokio::test]
        async fn test_real_server_connects_and_lists_tools() {
            let store = StateStore::in_memory(Arc::new(NoopNotifier));
            let config = BackendConfig::new("npx")
                .with_args(["-y", "@modelcontextprotocol/server-everything"]);
            let handle = spawn_backend_session(
                "everything".to_string(),
                config,
                store.clone(),
                Backoff::default(),
                CancellationToken::new(),
            );

            let mut status_rx = handle.status_rx.clone();
            tokio::time::timeout(
                Duration::from_secs(60),
                status_rx.wait_for(|s| *s == BackendStatus::Connected),
            )
            .await
            .expect("server should connect")
            .unwrap();

            let tools = store.server_tools("everything").await.unwrap();
            assert!(tools.iter().any(|t| t.name == "echo"));
            assert!(handle.refresh().await.unwrap() > 0);

            handle.shutdown().await;
            assert!(store.server_tools("everything").await.is_none());
        }
    }
}
