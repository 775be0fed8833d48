//! Stdio-over-WebSocket bridge.
//!
//! Each connection may bind one process through an `init` frame. Its stdout
//! and stderr come back as frames, `stdin` frames are written to it, and the
//! connection and the process end together. `host-command` frames run
//! allow-listed programs independently of any bound process.

mod connection;
pub mod frame;
pub mod host;
mod process;
mod server;

pub use connection::run_connection;
pub use frame::{InboundFrame, OutboundFrame};
pub use host::HostCommands;
pub use process::ExitInfo;
pub use server::{bridge_router, serve_bridge, serve_on};
