//! The process a bridge connection is bound to.
//!
//! A supervisor task owns the `Child`. It waits for the process to end (or
//! kills it when asked), lets the output readers drain, and only then reports
//! the exit. Output frames are therefore always queued before the exit.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::frame::OutboundFrame;
use crate::error::HubError;

/// How long output readers may keep draining after the process exited.
/// Grandchildren holding the pipes open would otherwise stall the exit frame.
const OUTPUT_GRACE: Duration = Duration::from_millis(500);

/// How a bound process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<String>,
}

impl ExitInfo {
    fn from_status(status: &ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: exit_signal(status),
        }
    }

    pub fn into_frame(self) -> OutboundFrame {
        OutboundFrame::Exit {
            code: self.code,
            signal: self.signal,
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(signal_name)
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<String> {
    None
}

fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        3 => "SIGQUIT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        13 => "SIGPIPE".to_string(),
        14 => "SIGALRM".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("SIG{}", other),
    }
}

/// A running process plus the tasks that pump its stdio.
pub struct BoundProcess {
    pid: Option<u32>,
    stdin_tx: mpsc::UnboundedSender<String>,
    exit_rx: oneshot::Receiver<ExitInfo>,
    kill: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl BoundProcess {
    /// Spawn `command` with the bridge's environment plus `env`, announce it
    /// with a `ready` frame, then forward its output to `outbound`.
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        outbound: mpsc::Sender<OutboundFrame>,
    ) -> crate::Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HubError::Spawn(command.to_string(), e.to_string()))?;

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(HubError::Spawn(
                command.to_string(),
                "child stdio was not captured".to_string(),
            ));
        };

        let ready = OutboundFrame::Ready {
            message: format!(
                "process started (pid {})",
                pid.map(|p| p.to_string()).unwrap_or_default()
            ),
        };
        if outbound.send(ready).await.is_err() {
            tracing::debug!(command = %command, "client gone before ready");
        }

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump_stdin(stdin, stdin_rx));

        let stdout_task = tokio::spawn(forward_lines(stdout, outbound.clone(), |data| {
            OutboundFrame::Stdout { data }
        }));
        let stderr_task = tokio::spawn(forward_lines(stderr, outbound, |data| {
            OutboundFrame::Stderr { data }
        }));

        let (exit_tx, exit_rx) = oneshot::channel();
        let kill = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(
            child,
            stdout_task,
            stderr_task,
            exit_tx,
            kill.clone(),
        ));

        tracing::info!(command = %command, pid = ?pid, "bridge process started");
        Ok(Self {
            pid,
            stdin_tx,
            exit_rx,
            kill,
            supervisor,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Queue `data` for the process's stdin. Returns false once stdin is gone.
    pub fn write(&self, data: String) -> bool {
        self.stdin_tx.send(data).is_ok()
    }

    /// Resolves once the process ended and its output was forwarded.
    pub async fn exited(&mut self) -> ExitInfo {
        match (&mut self.exit_rx).await {
            Ok(info) => info,
            Err(_) => ExitInfo {
                code: None,
                signal: None,
            },
        }
    }

    /// Kill the process and wait until it has been reaped.
    pub async fn terminate(self) {
        self.kill.cancel();
        if let Err(e) = self.supervisor.await {
            tracing::warn!(pid = ?self.pid, error = %e, "bridge process supervisor failed");
        }
    }
}

async fn supervise(
    mut child: Child,
    mut stdout_task: JoinHandle<()>,
    mut stderr_task: JoinHandle<()>,
    exit_tx: oneshot::Sender<ExitInfo>,
    kill: CancellationToken,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(pid = ?pid, error = %e, "kill failed, process already gone");
            }
            child.wait().await
        }
    };

    let drained = tokio::time::timeout(OUTPUT_GRACE, async {
        let _ = (&mut stdout_task).await;
        let _ = (&mut stderr_task).await;
    })
    .await;
    if drained.is_err() {
        tracing::debug!(pid = ?pid, "output still open after exit, dropping the rest");
    }
    stdout_task.abort();
    stderr_task.abort();

    let info = match status {
        Ok(status) => ExitInfo::from_status(&status),
        Err(e) => {
            tracing::warn!(pid = ?pid, error = %e, "failed to wait for bridge process");
            ExitInfo {
                code: None,
                signal: None,
            }
        }
    };
    tracing::info!(pid = ?pid, code = ?info.code, signal = ?info.signal, "bridge process exited");
    let _ = exit_tx.send(info);
}

async fn pump_stdin(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(data) = rx.recv().await {
        if stdin.write_all(data.as_bytes()).await.is_err() || stdin.flush().await.is_err() {
            break;
        }
    }
}

/// Forward `reader` line by line, newline included. A trailing partial line
/// is sent at EOF.
async fn forward_lines<R, F>(reader: R, outbound: mpsc::Sender<OutboundFrame>, make: F)
where
    R: AsyncRead + Unpin,
    F: Fn(String) -> OutboundFrame,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let data = String::from_utf8_lossy(&buf).into_owned();
                if outbound.send(make(data)).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(15), "SIGTERM");
        assert_eq!(signal_name(9), "SIGKILL");
        assert_eq!(signal_name(40), "SIG40");
    }

    #[tokio::test]
    async fn test_output_precedes_exit() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut process =
            BoundProcess::spawn("sh", &sh("printf 'a\\nb'; exit 4"), &HashMap::new(), tx)
                .await
                .unwrap();

        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Ready { .. })));
        let info = process.exited().await;
        assert_eq!(info.code, Some(4));
        assert_eq!(info.signal, None);

        // Both lines were queued before the exit was reported.
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Stdout { data: "a\n".into() });
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Stdout { data: "b".into() });
        process.terminate().await;
    }

    #[tokio::test]
    async fn test_env_overrides_are_applied() {
        let (tx, mut rx) = mpsc::channel(16);
        let env = HashMap::from([("MCP_HUB_TEST_VAR".to_string(), "set".to_string())]);
        let mut process =
            BoundProcess::spawn("sh", &sh("echo \"$MCP_HUB_TEST_VAR\""), &env, tx)
                .await
                .unwrap();
        process.exited().await;
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Ready { .. })));
        assert_eq!(rx.try_recv().unwrap(), OutboundFrame::Stdout { data: "set\n".into() });
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut process =
            BoundProcess::spawn("sh", &sh("printf 'x\\377y\\n' >&2"), &HashMap::new(), tx)
                .await
                .unwrap();
        process.exited().await;
        assert!(matches!(rx.try_recv(), Ok(OutboundFrame::Ready { .. })));
        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundFrame::Stderr { data: "x\u{FFFD}y\n".into() }
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_reaps_process() {
        let (tx, _rx) = mpsc::channel(16);
        let process = BoundProcess::spawn("sleep", &["30".to_string()], &HashMap::new(), tx)
            .await
            .unwrap();
        let pid = process.pid().unwrap();
        assert!(std::path::Path::new(&format!("/proc/{pid}")).exists());

        process.terminate().await;
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[tokio::test]
    async fn test_killed_by_signal() {
        let (tx, _rx) = mpsc::channel(16);
        let mut process =
            BoundProcess::spawn("sh", &sh("kill -TERM $$"), &HashMap::new(), tx)
                .await
                .unwrap();
        let info = process.exited().await;
        assert_eq!(info.code, None);
        assert_eq!(info.signal.as_deref(), Some("SIGTERM"));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let (tx, _rx) = mpsc::channel(16);
        let result = BoundProcess::spawn(
            "/this/command/does/not/exist-mcp-hub",
            &[],
            &HashMap::new(),
            tx,
        )
        .await;
        assert!(matches!(result, Err(HubError::Spawn(..))));
    }
}
