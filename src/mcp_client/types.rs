//! Shared types for the MCP connection layer.
//!
//! JSON-RPC 2.0 message types, server definitions, and session state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// Internal JSON-RPC error code, used when a response carries neither
/// `result` nor `error`.
pub const INTERNAL_ERROR: i32 = -32603;

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Tool descriptor as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Result of a tool call execution.
///
/// A tool that answers with a JSON-RPC error is still a completed round trip:
/// `success` is `false` and `error` carries the server's message.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub server_id: String,
    pub tool_name: String,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

// ─── Server Definitions ──────────────────────────────────────────────────────

/// How to reach a server: spawn a process speaking MCP on stdio, or POST
/// JSON-RPC to an HTTP endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportSpec {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    Http {
        url: String,
    },
}

impl TransportSpec {
    /// Short label for logs: the command or the URL.
    pub fn endpoint(&self) -> &str {
        match self {
            TransportSpec::Stdio { command, .. } => command,
            TransportSpec::Http { url } => url,
        }
    }
}

/// Exponential backoff parameters for automatic reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            factor: 2.0,
            max_ms: 30_000,
            max_attempts: 5,
        }
    }
}

/// One server definition.
///
/// In a config file the `id` comes from the `mcpServers` map key; the
/// transport fields sit next to the optional overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub transport: TransportSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffConfig>,
}

impl ServerConfig {
    /// A stdio server with no overrides.
    pub fn stdio(id: &str, command: &str, args: &[&str]) -> Self {
        Self::with_transport(
            id,
            TransportSpec::Stdio {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: BTreeMap::new(),
                cwd: None,
            },
        )
    }

    /// An HTTP server with no overrides.
    pub fn http(id: &str, url: &str) -> Self {
        Self::with_transport(id, TransportSpec::Http { url: url.to_string() })
    }

    /// A server with the given transport and no overrides.
    pub fn with_transport(id: &str, transport: TransportSpec) -> Self {
        Self {
            id: id.to_string(),
            transport,
            ping_interval_ms: None,
            ping_timeout_ms: None,
            failure_threshold: None,
            connect_timeout_ms: None,
            call_timeout_ms: None,
            backoff: None,
        }
    }
}

// ─── Session State ───────────────────────────────────────────────────────────

/// Connection state of a single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// Heartbeat failures are accumulating; the transport is believed alive
    /// but unconfirmed.
    Degraded,
    Reconnecting,
    /// Terminal until a caller explicitly asks to reconnect.
    Failed,
    Closed,
}

impl SessionState {
    /// Whether requests may be issued in this state.
    pub fn is_usable(self) -> bool {
        matches!(self, SessionState::Connected | SessionState::Degraded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Degraded => "degraded",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation kinds whose round-trip time is tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Ping,
    ToolCall,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Ping => f.write_str("ping"),
            OpKind::ToolCall => f.write_str("tool_call"),
        }
    }
}

/// Point-in-time liveness summary for one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub server_id: String,
    pub endpoint: String,
    pub state: SessionState,
    pub generation: u64,
    pub consecutive_failures: u32,
    pub last_ping_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub tool_count: Option<usize>,
    pub reconnect_attempts: u32,
    pub pending_tasks: usize,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
