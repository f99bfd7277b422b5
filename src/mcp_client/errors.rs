//! MCP Client error types.

use thiserror::Error;

use super::types::CapabilityKind;

/// Coarse error class, used by callers to decide who recovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection refused, pipe broken, stream reset. Fatal to the session.
    Transport,
    /// Version mismatch or discovery failure. Fatal to one registration.
    Handshake,
    /// Unknown capability, bad arguments, remote failure, timeout.
    Invocation,
    /// A resource failed to close.
    Shutdown,
    /// Bad server list or registry misuse.
    Config,
}

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The transport to a server could not be established.
    #[error("failed to connect to server '{server}': {reason}")]
    ConnectFailed { server: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// The transport was already closed or invalidated by an earlier failure.
    #[error("transport for server '{server}' is closed")]
    TransportClosed { server: String },

    /// The initialization handshake or capability discovery failed.
    #[error("server '{server}' handshake failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    /// The server answered `initialize` with a protocol version we don't speak.
    #[error(
        "server '{server}' negotiated unsupported protocol version '{received}' \
         (offered '{offered}')"
    )]
    VersionMismatch {
        server: String,
        offered: String,
        received: String,
    },

    /// The session was closed; it must not be used again.
    #[error("session for server '{server}' is closed")]
    SessionClosed { server: String },

    /// An earlier request timed out; the session refuses further calls.
    #[error("session for server '{server}' is degraded: {reason}")]
    SessionDegraded { server: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Capability not found in the aggregated table.
    #[error("unknown {kind}: '{name}'")]
    UnknownCapability { kind: CapabilityKind, name: String },

    /// Tool call arguments failed schema validation.
    #[error("invalid arguments for '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },

    /// A request did not get its response in time.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The request was abandoned because the session is shutting down.
    #[error("request '{method}' to server '{server}' was cancelled")]
    Cancelled { server: String, method: String },

    /// A server with this name is already registered.
    #[error("server '{name}' is already registered")]
    DuplicateServer { name: String },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Closing a server's resources failed.
    #[error("failed to shut down server '{server}': {reason}")]
    ShutdownFailed { server: String, reason: String },
}

impl McpError {
    /// Which layer is expected to recover from this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ConnectFailed { .. }
            | Self::TransportError { .. }
            | Self::TransportClosed { .. } => ErrorCategory::Transport,
            Self::HandshakeFailed { .. } | Self::VersionMismatch { .. } => ErrorCategory::Handshake,
            Self::SessionClosed { .. }
            | Self::SessionDegraded { .. }
            | Self::ServerError { .. }
            | Self::UnknownCapability { .. }
            | Self::InvalidArguments { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. } => ErrorCategory::Invocation,
            Self::ShutdownFailed { .. } => ErrorCategory::Shutdown,
            Self::DuplicateServer { .. } | Self::ConfigError { .. } => ErrorCategory::Config,
        }
    }

    /// Whether the owning session can no longer be used after this error.
    pub fn invalidates_session(&self) -> bool {
        matches!(
            self,
            Self::TransportError { .. } | Self::TransportClosed { .. } | Self::SessionClosed { .. }
        )
    }
}
