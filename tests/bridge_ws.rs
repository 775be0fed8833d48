//! End-to-end tests for the bridge over a real WebSocket.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mcp_hub::bridge::{serve_on, HostCommands, OutboundFrame};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_bridge() -> (SocketAddr, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(serve_on(listener, HostCommands::default(), cancel.clone()));
    (addr, cancel)
}

async fn connect(addr: SocketAddr, path: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}{path}")).await.unwrap();
    ws
}

async fn send(ws: &mut Client, frame: serde_json::Value) {
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

/// Next frame, or `None` once the bridge closed the connection.
async fn next_frame(ws: &mut Client) -> Option<OutboundFrame> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame");
        match message {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).unwrap());
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

fn pid_from_ready(frame: Option<OutboundFrame>) -> u32 {
    match frame {
        Some(OutboundFrame::Ready { message }) => message
            .trim_start_matches("process started (pid ")
            .trim_end_matches(')')
            .parse()
            .unwrap(),
        other => panic!("expected ready, got {other:?}"),
    }
}

/// `kill -0` fails once the process is gone and reaped.
fn alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_echo_through_cat() {
    let (addr, cancel) = start_bridge().await;
    let mut ws = connect(addr, "/bridge").await;

    send(&mut ws, json!({"type": "init", "command": "cat"})).await;
    pid_from_ready(next_frame(&mut ws).await);

    send(&mut ws, json!({"type": "stdin", "data": "{\"jsonrpc\":\"2.0\"}\n"})).await;
    assert_eq!(
        next_frame(&mut ws).await,
        Some(OutboundFrame::Stdout {
            data: "{\"jsonrpc\":\"2.0\"}\n".to_string()
        })
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_exit_frame_then_close() {
    let (addr, cancel) = start_bridge().await;
    let mut ws = connect(addr, "/").await;

    send(
        &mut ws,
        json!({"type": "init", "command": "sh", "args": ["-c", "echo bye >&2; exit 7"]}),
    )
    .await;
    let pid = pid_from_ready(next_frame(&mut ws).await);

    assert_eq!(
        next_frame(&mut ws).await,
        Some(OutboundFrame::Stderr {
            data: "bye\n".to_string()
        })
    );
    assert_eq!(
        next_frame(&mut ws).await,
        Some(OutboundFrame::Exit {
            code: Some(7),
            signal: None
        })
    );
    assert_eq!(next_frame(&mut ws).await, None);

    assert!(!alive(pid));
    cancel.cancel();
}

#[tokio::test]
async fn test_client_disconnect_kills_process() {
    let (addr, cancel) = start_bridge().await;
    let mut ws = connect(addr, "/bridge").await;

    send(&mut ws, json!({"type": "init", "command": "sleep", "args": ["30"]})).await;
    let pid = pid_from_ready(next_frame(&mut ws).await);
    assert!(alive(pid));

    ws.close(None).await.unwrap();
    drop(ws);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while alive(pid) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!alive(pid), "process {pid} outlived its connection");
    cancel.cancel();
}

#[tokio::test]
async fn test_host_commands_over_socket() {
    let (addr, cancel) = start_bridge().await;
    let mut ws = connect(addr, "/bridge").await;

    send(&mut ws, json!({"type": "host-command", "command": "rm", "args": ["-rf", "/tmp/x"]}))
        .await;
    assert!(matches!(
        next_frame(&mut ws).await,
        Some(OutboundFrame::HostCommandResult { success: false, .. })
    ));

    send(&mut ws, json!({"type": "host-command", "command": "echo", "args": ["hub"]})).await;
    assert_eq!(
        next_frame(&mut ws).await,
        Some(OutboundFrame::HostCommandResult {
            success: true,
            data: Some("hub\n".to_string()),
            message: None,
            code: Some(0),
        })
    );
    cancel.cancel();
}

#[tokio::test]
async fn test_malformed_then_valid() {
    let (addr, cancel) = start_bridge().await;
    let mut ws = connect(addr, "/bridge").await;

    ws.send(Message::text("definitely not json")).await.unwrap();
    assert!(matches!(
        next_frame(&mut ws).await,
        Some(OutboundFrame::Error { .. })
    ));

    send(&mut ws, json!({"type": "init", "command": "cat"})).await;
    pid_from_ready(next_frame(&mut ws).await);
    cancel.cancel();
}
