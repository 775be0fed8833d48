//! Error types for hub operations.

use thiserror::Error;

/// Main error type for hub operations
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// Runtime settings or configuration document are unusable
    #[error("invalid config for '{0}': {1}")]
    InvalidConfig(String, String),

    /// A process could not be started
    #[error("failed to spawn '{0}': {1}")]
    Spawn(String, String),

    /// An inbound bridge frame could not be decoded
    #[error("malformed frame: {0}")]
    Frame(String),

    /// A state update was rejected; the prior state is preserved
    #[error("invalid state for server '{0}': {1}")]
    Validation(String, String),

    /// A session state machine transition that the lifecycle does not allow
    #[error("server '{name}' cannot go from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: String,
        to: String,
    },

    /// Writing a snapshot file failed
    #[error("failed to persist '{0}': {1}")]
    Persistence(String, String),

    /// No migration covers the requested version delta
    #[error("no migration path from {0} to {1}")]
    MigrationGap(String, String),

    /// A version string is not dot-separated numeric segments
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    /// MCP handshake or tool discovery failed for a backend
    #[error("initialization failed for server '{0}': {1}")]
    InitializationFailed(String, String),

    /// Transport-level error for a named backend
    #[error("transport error for server '{0}': {1}")]
    Transport(String, String),

    /// JSON or TOML (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Backend is shutting down
    #[error("server '{0}' shutting down")]
    ShuttingDown(String),
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Serialization(err.to_string())
    }
}

impl HubError {
    /// Short category label, recorded as `errorType` on failed backends.
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::InvalidConfig(..) => "config",
            HubError::Spawn(..) => "spawn",
            HubError::Frame(..) => "frame",
            HubError::Validation(..) | HubError::InvalidTransition { .. } => "validation",
            HubError::Persistence(..) => "persistence",
            HubError::MigrationGap(..) | HubError::InvalidVersion(..) => "migration",
            HubError::InitializationFailed(..) => "initialization",
            HubError::Transport(..) => "transport",
            HubError::Serialization(..) => "serialization",
            HubError::ShuttingDown(..) => "shutdown",
        }
    }
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;
