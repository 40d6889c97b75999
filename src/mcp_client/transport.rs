//! Transport boundary.
//!
//! The reliability layer only ever sees two narrow capabilities:
//! - `McpTransport`: turn a `TransportSpec` into a live connection
//! - `McpConnection`: ping, list tools, call a tool, close
//!
//! Timeouts are applied by the session around these calls, so implementations
//! may block for as long as the remote side takes. `DefaultTransport` routes
//! stdio specs to `StdioConnection` and HTTP specs to `HttpConnection`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::McpError;
use super::http::HttpConnection;
use super::stdio::StdioConnection;
use super::types::{JsonRpcResponse, ToolDescriptor, TransportSpec, INTERNAL_ERROR};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Capabilities ────────────────────────────────────────────────────────────

/// Opens connections to MCP servers.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Establish a connection and complete whatever handshake the protocol
    /// requires. The returned connection must be ready for requests.
    async fn connect(
        &self,
        server_id: &str,
        spec: &TransportSpec,
    ) -> Result<Arc<dyn McpConnection>, McpError>;
}

/// A live connection to one MCP server.
#[async_trait]
pub trait McpConnection: Send + Sync {
    /// Round-trip a liveness check.
    async fn ping(&self) -> Result<(), McpError>;

    /// Fetch the server's tool catalogue.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError>;

    /// Invoke a tool. A JSON-RPC error from the tool is returned as
    /// `McpError::ServerError`; anything else is a transport failure.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError>;

    /// Release the connection. Must be safe to call more than once.
    async fn close(&self);
}

// ─── Default Transport ───────────────────────────────────────────────────────

/// Transport that speaks MCP over child-process stdio or HTTP POST.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransport {
    /// Fallback working directory for stdio servers without their own `cwd`.
    working_dir: Option<String>,
}

impl DefaultTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn stdio servers relative to `dir` unless they set their own `cwd`.
    pub fn with_working_dir(dir: impl Into<String>) -> Self {
        Self {
            working_dir: Some(dir.into()),
        }
    }
}

#[async_trait]
impl McpTransport for DefaultTransport {
    async fn connect(
        &self,
        server_id: &str,
        spec: &TransportSpec,
    ) -> Result<Arc<dyn McpConnection>, McpError> {
        match spec {
            TransportSpec::Stdio { .. } => {
                let conn =
                    StdioConnection::spawn(server_id, spec, self.working_dir.as_deref()).await?;
                Ok(Arc::new(conn))
            }
            TransportSpec::Http { url } => {
                let conn = HttpConnection::connect(server_id, url).await?;
                Ok(Arc::new(conn))
            }
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

/// Parse the `tools` array out of a `tools/list` result.
pub fn parse_tools_list(
    server_id: &str,
    result: serde_json::Value,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let tools = result
        .get("tools")
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
    serde_json::from_value(tools).map_err(|e| McpError::TransportError {
        server: server_id.to_string(),
        reason: format!("malformed tools/list result: {e}"),
    })
}

/// Parameters for the MCP `initialize` request.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
