//! MCP connection error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility; these types carry the server id and reason
//! needed to build meaningful log entries.

use thiserror::Error;

use super::types::SessionState;

/// Errors that can occur while managing MCP server sessions.
#[derive(Debug, Error)]
pub enum McpError {
    /// A server definition was rejected at registration.
    #[error("invalid config for server '{server}': {reason}")]
    ConfigValidation { server: String, reason: String },

    /// Configuration file could not be read or parsed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// A connect, ping, or list-tools call exceeded its timeout.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    ConnectionTimeout {
        server: String,
        operation: &'static str,
        timeout_ms: u64,
    },

    /// I/O or protocol failure on the underlying transport.
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// A server process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No registered session is currently usable.
    #[error("no MCP session available")]
    NoAvailableSession,

    /// The caller referenced a server id that was never registered.
    #[error("unknown server: '{server}'")]
    UnknownServer { server: String },

    /// The session exists but is not in a state that accepts requests.
    #[error("server '{server}' is not ready (state: {state}){}", last_error_suffix(.last_error))]
    NotReady {
        server: String,
        state: SessionState,
        last_error: Option<String>,
    },

    /// A tool call failed at the transport level.
    #[error("tool call '{tool}' on server '{server}' failed: {reason}")]
    ToolInvocation {
        server: String,
        tool: String,
        reason: String,
    },

    /// A connect completed after the session had moved to a newer generation.
    #[error("connect to server '{server}' was superseded")]
    Superseded { server: String },

    /// All automatic reconnect attempts were used up.
    #[error("server '{server}' failed after {attempts} reconnect attempts")]
    ReconnectExhausted { server: String, attempts: u32 },

    /// The manager has been shut down and accepts no new servers.
    #[error("server manager is shut down")]
    ShutDown,
}

impl McpError {
    /// Whether this error comes from a network or process hiccup that the
    /// heartbeat/reconnect machinery is expected to absorb.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            McpError::ConnectionTimeout { .. }
                | McpError::TransportError { .. }
                | McpError::ToolInvocation { .. }
        )
    }
}

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(", last error: {e}"),
        None => String::new(),
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::ConfigError {
            reason: e.to_string(),
        }
    }
}
