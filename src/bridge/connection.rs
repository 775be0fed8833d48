//! One bridge connection, independent of the wire transport.
//!
//! The loop reads decoded text messages from `inbound` and writes frames to
//! `outbound`. It returns when the client goes away, the bound process exits,
//! or `cancel` fires; in every case the bound process is killed and reaped
//! before it returns.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::frame::{InboundFrame, OutboundFrame};
use super::host::HostCommands;
use super::process::{BoundProcess, ExitInfo};

enum Step {
    Message(Option<String>),
    Exited(ExitInfo),
    Cancelled,
}

struct Connection {
    id: u64,
    outbound: mpsc::Sender<OutboundFrame>,
    host: Arc<HostCommands>,
    process: Option<BoundProcess>,
    host_tasks: JoinSet<()>,
}

/// Drive one connection until it ends.
pub async fn run_connection(
    id: u64,
    mut inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<OutboundFrame>,
    host: Arc<HostCommands>,
    cancel: CancellationToken,
) {
    let mut conn = Connection {
        id,
        outbound,
        host,
        process: None,
        host_tasks: JoinSet::new(),
    };
    tracing::debug!(connection = id, "bridge connection opened");

    loop {
        let step = tokio::select! {
            message = inbound.recv() => Step::Message(message),
            info = wait_exit(&mut conn.process) => Step::Exited(info),
            _ = cancel.cancelled() => Step::Cancelled,
        };

        match step {
            Step::Message(Some(text)) => {
                if !conn.handle(&text).await {
                    break;
                }
            }
            Step::Message(None) => {
                tracing::debug!(connection = id, "client closed connection");
                break;
            }
            Step::Exited(info) => {
                let _ = conn.outbound.send(info.into_frame()).await;
                break;
            }
            Step::Cancelled => break,
        }
    }

    conn.close().await;
}

async fn wait_exit(process: &mut Option<BoundProcess>) -> ExitInfo {
    match process {
        Some(process) => process.exited().await,
        None => std::future::pending().await,
    }
}

impl Connection {
    /// Handle one inbound message. Returns false once the client is gone.
    async fn handle(&mut self, text: &str) -> bool {
        let frame = match InboundFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(connection = self.id, error = %e, "rejecting frame");
                return self.send(OutboundFrame::error(e.to_string())).await;
            }
        };

        match frame {
            InboundFrame::Init { command, args, env } => {
                if let Some(process) = &self.process {
                    let pid = process.pid().map(|p| p.to_string()).unwrap_or_default();
                    return self
                        .send(OutboundFrame::error(format!(
                            "process already running (pid {}); init rejected",
                            pid
                        )))
                        .await;
                }
                match BoundProcess::spawn(&command, &args, &env, self.outbound.clone()).await {
                    Ok(process) => {
                        self.process = Some(process);
                        !self.outbound.is_closed()
                    }
                    Err(e) => {
                        tracing::warn!(connection = self.id, error = %e, "bridge spawn failed");
                        self.send(OutboundFrame::error(e.to_string())).await
                    }
                }
            }
            InboundFrame::Stdin { data } => match &self.process {
                Some(process) if process.write(data) => true,
                Some(_) => {
                    self.send(OutboundFrame::error("process stdin is closed"))
                        .await
                }
                None => {
                    self.send(OutboundFrame::error("no process running; send init first"))
                        .await
                }
            },
            InboundFrame::HostCommand { command, args } => {
                self.reap_host_tasks();
                let host = Arc::clone(&self.host);
                let outbound = self.outbound.clone();
                self.host_tasks.spawn(async move {
                    let result = host.run(&command, &args).await;
                    let _ = outbound.send(result).await;
                });
                true
            }
        }
    }

    /// Drop host-command tasks that already finished.
    fn reap_host_tasks(&mut self) {
        while let Some(result) = self.host_tasks.try_join_next() {
            if let Err(e) = result {
                tracing::warn!(connection = self.id, error = %e, "host command task failed");
            }
        }
    }

    async fn send(&self, frame: OutboundFrame) -> bool {
        self.outbound.send(frame).await.is_ok()
    }

    async fn close(mut self) {
        self.host_tasks.shutdown().await;
        if let Some(process) = self.process.take() {
            tracing::debug!(connection = self.id, pid = ?process.pid(), "terminating bridge process");
            process.terminate().await;
        }
        tracing::debug!(connection = self.id, "bridge connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct Client {
        tx: Option<mpsc::Sender<String>>,
        rx: mpsc::Receiver<OutboundFrame>,
        task: JoinHandle<()>,
    }

    impl Client {
        fn open() -> Self {
            let (in_tx, in_rx) = mpsc::channel(16);
            let (out_tx, out_rx) = mpsc::channel(64);
            let task = tokio::spawn(run_connection(
                1,
                in_rx,
                out_tx,
                Arc::new(HostCommands::default()),
                CancellationToken::new(),
            ));
            Self {
                tx: Some(in_tx),
                rx: out_rx,
                task,
            }
        }

        async fn send(&self, frame: serde_json::Value) {
            self.send_text(frame.to_string()).await;
        }

        async fn send_text(&self, text: String) {
            if let Some(tx) = &self.tx {
                tx.send(text).await.unwrap();
            }
        }

        async fn next(&mut self) -> Option<OutboundFrame> {
            tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
                .await
                .expect("timed out waiting for frame")
        }

        async fn init(&mut self, command: &str, args: &[&str]) -> u32 {
            self.send(json!({"type": "init", "command": command, "args": args}))
                .await;
            match self.next().await {
                Some(OutboundFrame::Ready { message }) => message
                    .trim_start_matches("process started (pid ")
                    .trim_end_matches(')')
                    .parse()
                    .unwrap(),
                other => panic!("expected ready, got {other:?}"),
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn alive(pid: u32) -> bool {
        std::path::Path::new(&format!("/proc/{pid}")).exists()
    }

    #[tokio::test]
    async fn test_exit_is_sent_before_close() {
        let mut client = Client::open();
        client.init("sh", &["-c", "echo hello; exit 3"]).await;

        let mut frames = Vec::new();
        while let Some(frame) = client.next().await {
            frames.push(frame);
        }
        assert_eq!(
            frames,
            vec![
                OutboundFrame::Stdout { data: "hello\n".into() },
                OutboundFrame::Exit { code: Some(3), signal: None },
            ]
        );
        client.task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded() {
        let mut client = Client::open();
        client.init("cat", &[]).await;
        client.send(json!({"type": "stdin", "data": "ping\n"})).await;
        assert_eq!(
            client.next().await,
            Some(OutboundFrame::Stdout { data: "ping\n".into() })
        );
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_close_kills_process() {
        let mut client = Client::open();
        let pid = client.init("sleep", &["30"]).await;
        assert!(alive(pid));

        client.tx = None;
        client.task.await.unwrap();
        assert!(!alive(pid), "process {pid} outlived its connection");
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_process() {
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_connection(
            2,
            in_rx,
            out_tx,
            Arc::new(HostCommands::default()),
            cancel.clone(),
        ));
        in_tx
            .send(json!({"type": "init", "command": "sleep", "args": ["30"]}).to_string())
            .await
            .unwrap();
        let Some(OutboundFrame::Ready { message }) = out_rx.recv().await else {
            panic!("expected ready");
        };
        let pid: u32 = message
            .trim_start_matches("process started (pid ")
            .trim_end_matches(')')
            .parse()
            .unwrap();

        cancel.cancel();
        task.await.unwrap();
        assert!(!alive(pid));
    }

    #[tokio::test]
    async fn test_second_init_is_rejected() {
        let mut client = Client::open();
        client.init("cat", &[]).await;

        client.send(json!({"type": "init", "command": "sleep", "args": ["1"]})).await;
        match client.next().await {
            Some(OutboundFrame::Error { message }) => {
                assert!(message.starts_with("process already running"), "{message}")
            }
            other => panic!("expected error, got {other:?}"),
        }

        // The first process is still bound.
        client.send(json!({"type": "stdin", "data": "still here\n"})).await;
        assert_eq!(
            client.next().await,
            Some(OutboundFrame::Stdout { data: "still here\n".into() })
        );
    }

    #[tokio::test]
    async fn test_stdin_before_init() {
        let mut client = Client::open();
        client.send(json!({"type": "stdin", "data": "x"})).await;
        assert!(matches!(client.next().await, Some(OutboundFrame::Error { .. })));
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection_open() {
        let mut client = Client::open();
        client.send_text("{oops".to_string()).await;
        assert!(matches!(client.next().await, Some(OutboundFrame::Error { .. })));

        client
            .send(json!({"type": "host-command", "command": "echo", "args": ["ok"]}))
            .await;
        assert!(matches!(
            client.next().await,
            Some(OutboundFrame::HostCommandResult { success: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_connection_unbound() {
        let mut client = Client::open();
        client
            .send(json!({"type": "init", "command": "/this/command/does/not/exist-mcp-hub"}))
            .await;
        assert!(matches!(client.next().await, Some(OutboundFrame::Error { .. })));

        // A later init may still bind.
        client.init("cat", &[]).await;
    }

    #[tokio::test]
    async fn test_host_command_not_allowed() {
        let mut client = Client::open();
        client
            .send(json!({"type": "host-command", "command": "rm", "args": ["-rf", "/"]}))
            .await;
        assert!(matches!(
            client.next().await,
            Some(OutboundFrame::HostCommandResult { success: false, code: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_host_command_is_refused() {
        let mut client = Client::open();
        client
            .send(json!({"type": "host-command", "command": ""}))
            .await;
        assert!(matches!(
            client.next().await,
            Some(OutboundFrame::HostCommandResult { success: false, code: None, data: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_finished_host_tasks_are_reaped() {
        let (out_tx, mut out_rx) = mpsc::channel(64);
        let mut conn = Connection {
            id: 3,
            outbound: out_tx,
            host: Arc::new(HostCommands::default()),
            process: None,
            host_tasks: JoinSet::new(),
        };
        let frame = json!({"type": "host-command", "command": "echo", "args": ["x"]}).to_string();

        for _ in 0..20 {
            assert!(conn.handle(&frame).await);
        }
        for _ in 0..20 {
            assert!(matches!(
                out_rx.recv().await,
                Some(OutboundFrame::HostCommandResult { success: true, .. })
            ));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(conn.handle(&frame).await);
        assert_eq!(conn.host_tasks.len(), 1);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_signal_exit() {
        let mut client = Client::open();
        client.init("sh", &["-c", "kill -TERM $$"]).await;
        assert_eq!(
            client.next().await,
            Some(OutboundFrame::Exit {
                code: None,
                signal: Some("SIGTERM".into())
            })
        );
        assert_eq!(client.next().await, None);
    }
}
