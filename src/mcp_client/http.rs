//! JSON-RPC over MCP Streamable HTTP.
//!
//! Each request is an independent POST of one JSON-RPC message. Handshake:
//! 1. POST `initialize`; the server answers with the result and may hand out
//!    an `Mcp-Session-Id`, which is echoed on every later request
//! 2. POST `notifications/initialized`; the server answers `202 Accepted`
//!
//! Responses arrive either as a plain JSON body or as a `text/event-stream`
//! body whose `data:` events carry JSON-RPC messages.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;
use serde::Serialize;

use super::errors::McpError;
use super::transport::{
    extract_result, initialize_params, next_request_id, parse_tools_list, McpConnection,
};
use super::types::{JsonRpcRequest, JsonRpcResponse, ToolDescriptor};

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Streamable HTTP servers may answer with JSON or an SSE stream.
const ACCEPT_BOTH: &str = "application/json, text/event-stream";

/// A logical MCP connection to an HTTP endpoint.
pub struct HttpConnection {
    server_name: String,
    url: String,
    http: HttpClient,
    session_id: Mutex<Option<String>>,
}

impl HttpConnection {
    /// Build the client and complete the `initialize` handshake.
    pub async fn connect(name: &str, url: &str) -> Result<Self, McpError> {
        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::TransportError {
                server: name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let conn = Self {
            server_name: name.to_string(),
            url: url.to_string(),
            http,
            session_id: Mutex::new(None),
        };

        let init_failed = |e: McpError| McpError::InitFailed {
            name: name.to_string(),
            reason: e.to_string(),
        };

        let response = conn
            .request("initialize", Some(initialize_params()))
            .await
            .map_err(init_failed)?;
        extract_result(response).map_err(init_failed)?;
        conn.notify("notifications/initialized")
            .await
            .map_err(init_failed)?;

        Ok(conn)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let resp = self.post(&JsonRpcRequest::new(id, method, params)).await?;

        let is_event_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("text/event-stream"));

        if !is_event_stream {
            return resp
                .json::<JsonRpcResponse>()
                .await
                .map_err(|e| self.transport_error(format!("malformed JSON-RPC response: {e}")));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read event stream: {e}")))?;
        parse_event_stream(&body, id).ok_or_else(|| {
            self.transport_error(format!("event stream ended without a response to {method}"))
        })
    }

    /// POST a notification; any 2xx (normally `202 Accepted`) is success.
    async fn notify(&self, method: &str) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        self.post(&notification).await.map(|_| ())
    }

    /// Send one JSON-RPC message, tracking the session id and rejecting
    /// non-success statuses.
    async fn post(&self, message: &impl Serialize) -> Result<reqwest::Response, McpError> {
        let mut builder = self
            .http
            .post(&self.url)
            .header(ACCEPT, ACCEPT_BOTH)
            .json(message);
        if let Some(session_id) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session_id);
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| self.transport_error(format!("request failed: {e}")))?;

        if let Some(value) = resp.headers().get(SESSION_HEADER) {
            if let Ok(session_id) = value.to_str() {
                *self
                    .session_id
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
            }
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {status}: {body}")));
        }
        Ok(resp)
    }

    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

/// Find the response to request `id` among the events of an SSE body.
///
/// Multi-line `data:` fields are joined with newlines. Events carrying a
/// `method` are server-initiated messages and are skipped.
fn parse_event_stream(body: &str, id: u64) -> Option<JsonRpcResponse> {
    let mut data = String::new();
    let mut events = Vec::new();

    for line in body.lines() {
        if line.is_empty() {
            if !data.is_empty() {
                events.push(std::mem::take(&mut data));
            }
            continue;
        }
        if let Some(value) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(value.strip_prefix(' ').unwrap_or(value));
        }
    }
    if !data.is_empty() {
        events.push(data);
    }

    events.iter().find_map(|event| {
        let value: serde_json::Value = serde_json::from_str(event).ok()?;
        if value.get("method").is_some() {
            return None;
        }
        let resp: JsonRpcResponse = serde_json::from_value(value).ok()?;
        (resp.id == id).then_some(resp)
    })
}

#[async_trait]
impl McpConnection for HttpConnection {
    async fn ping(&self) -> Result<(), McpError> {
        let response = self.request("ping", None).await?;
        extract_result(response).map(|_| ())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let response = self.request("tools/list", None).await?;
        parse_tools_list(&self.server_name, extract_result(response)?)
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let response = self.request("tools/call", Some(params)).await?;
        extract_result(response)
    }

    async fn close(&self) {
        // Stateless transport: forgetting the session id is all there is to release
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
