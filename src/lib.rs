//! MCP hub core.
//! Runs stdio MCP backends and namespaces their tools, tracks backend state
//! and tool catalogs with crash-tolerant snapshots, validates and migrates
//! the configuration document, and tunnels process stdio over WebSocket.

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod hot_reload;
pub mod namespace;
pub mod registry;
pub mod session;
pub mod state;

pub use bridge::{serve_bridge, HostCommands, InboundFrame, OutboundFrame};
pub use config::{
    load_document, parse_env_ref, resolve_env_vars, validate, write_document, BackendConfig,
    ConfigDocument, HubSettings, LoadedDocument, Migrator, ValidationReport,
};
pub use error::{HubError, Result};
pub use events::{Notice, NoticeLevel, Notifier, StoreEvent, SubscriptionId, TracingNotifier};
pub use hot_reload::run_hot_reload;
pub use namespace::AggregatedTool;
pub use registry::{BackendRegistry, ReconcileSummary};
pub use state::{BackendState, BackendStatus, StatePatch, StateStore, StorePaths, ToolDescriptor};
