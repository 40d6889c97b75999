//! JSON-RPC over child-process stdio.
//!
//! Spawns the server process, performs the MCP `initialize` handshake, and
//! multiplexes requests over the pipe pair:
//! - Requests are written to stdin, one JSON object per line
//! - A reader task routes stdout responses to waiters by request `id`
//! - Non-JSON stdout lines (including non-UTF-8 bytes) are treated as server
//!   log output and skipped, as are server-initiated requests
//! - stderr is drained into a short tail used in startup error messages

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{
    extract_result, initialize_params, next_request_id, parse_tools_list, McpConnection,
};
use super::types::{JsonRpcRequest, JsonRpcResponse, ToolDescriptor, TransportSpec};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Time allowed for the process to exit after stdin closes before it is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum stderr bytes retained for diagnostics.
const STDERR_TAIL_BYTES: usize = 2000;

/// Response waiters by request id. `closed` is set once stdout hits EOF so
/// no waiter can be registered after the reader has gone away.
#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

type PendingMap = Arc<StdMutex<Pending>>;

// ─── StdioConnection ─────────────────────────────────────────────────────────

/// A running MCP server process and its JSON-RPC channel.
///
/// The child is spawned with `kill_on_drop`, so dropping the connection on any
/// path (timeout, cancellation, explicit close) never leaks the process.
pub struct StdioConnection {
    server_name: String,
    writer: Mutex<Option<ChildStdin>>,
    pending: PendingMap,
    child: Mutex<Option<Child>>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
    stderr_tail: Arc<StdMutex<String>>,
}

impl StdioConnection {
    /// Spawn the server described by `spec` and complete the handshake.
    pub async fn spawn(
        name: &str,
        spec: &TransportSpec,
        working_dir: Option<&str>,
    ) -> Result<Self, McpError> {
        let TransportSpec::Stdio {
            command,
            args,
            env,
            cwd,
        } = spec
        else {
            return Err(McpError::SpawnFailed {
                name: name.to_string(),
                reason: format!("not a stdio transport: {}", spec.endpoint()),
            });
        };

        let mut cmd = Command::new(command);
        cmd.args(args);
        for (key, value) in env {
            cmd.env(key, value);
        }

        // Per-server cwd overrides the transport-wide working_dir
        if let Some(dir) = cwd.as_deref().or(working_dir) {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = Arc::new(StdMutex::new(String::new()));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, Arc::clone(&stderr_tail))));

        let pending: PendingMap = Arc::new(StdMutex::new(Pending::default()));
        let reader_task = tokio::spawn(route_responses(
            name.to_string(),
            stdout,
            Arc::clone(&pending),
        ));

        let conn = Self {
            server_name: name.to_string(),
            writer: Mutex::new(Some(stdin)),
            pending,
            child: Mutex::new(Some(child)),
            reader_task,
            stderr_task,
            stderr_tail,
        };

        if let Err(e) = conn.initialize().await {
            let stderr_ctx = conn.stderr_tail();
            if !stderr_ctx.is_empty() {
                tracing::warn!(
                    server = name,
                    stderr = %stderr_ctx,
                    "server stderr captured on failure"
                );
            }
            conn.close().await;
            return Err(McpError::InitFailed {
                name: name.to_string(),
                reason: format!("{e}{}", format_stderr_suffix(&stderr_ctx)),
            });
        }

        Ok(conn)
    }

    /// Perform the MCP initialization handshake.
    async fn initialize(&self) -> Result<(), McpError> {
        let response = self
            .request("initialize", Some(initialize_params()))
            .await?;
        extract_result(response)?;
        self.notify("notifications/initialized", None).await
    }

    /// Send a JSON-RPC request and wait for the response with the same `id`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);

        let mut json = serde_json::to_string(&req).map_err(|e| self.transport_error(format!(
            "failed to serialize request: {e}"
        )))?;
        json.push('\n');

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.pending);
            if pending.closed {
                return Err(self.transport_error("server stdout closed".into()));
            }
            pending.waiters.insert(id, tx);
        }
        // Removes the waiter if this future is dropped by a timeout
        let _waiter = PendingGuard {
            pending: &self.pending,
            id,
        };

        self.write_line(&json).await?;

        rx.await.map_err(|_| {
            self.transport_error("server stdout closed (process may have exited)".into())
        })
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });

        let mut json = serde_json::to_string(&notification).map_err(|e| {
            self.transport_error(format!("failed to serialize notification: {e}"))
        })?;
        json.push('\n');

        self.write_line(&json).await
    }

    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("connection closed".into()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }

    fn stderr_tail(&self) -> String {
        lock(&self.stderr_tail).clone()
    }
}

#[async_trait]
impl McpConnection for StdioConnection {
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
        // Closing stdin is the MCP stdio shutdown signal
        drop(self.writer.lock().await.take());

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(_)) => {}
                _ => {
                    let _ = child.kill().await;
                }
            }
        }

        self.reader_task.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
        let mut pending = lock(&self.pending);
        pending.closed = true;
        pending.waiters.clear();
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = &self.stderr_task {
            task.abort();
        }
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Read stdout lines and hand each response to the waiter with its `id`.
///
/// On EOF every outstanding waiter is dropped, which surfaces as a transport
/// error in `request`.
async fn route_responses(server_name: String, stdout: ChildStdout, pending: PendingMap) {
    let mut reader = BufReader::new(stdout);
    let mut line_buf = Vec::new();

    loop {
        line_buf.clear();
        match reader.read_until(b'\n', &mut line_buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "failed to read server stdout");
                break;
            }
        }

        let line = String::from_utf8_lossy(&line_buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        match parse_response_line(trimmed) {
            Some(resp) => {
                let waiter = lock(&pending).waiters.remove(&resp.id);
                if let Some(tx) = waiter {
                    let _ = tx.send(resp);
                }
            }
            None => {
                tracing::trace!(server = %server_name, line = trimmed, "non-response stdout line");
            }
        }
    }

    let mut waiters = lock(&pending);
    waiters.closed = true;
    waiters.waiters.clear();
}

/// Parse one stdout line as a response to one of our requests.
///
/// Anything with a `method` is a server-initiated request or notification and
/// is not a response, even when it carries an `id`.
fn parse_response_line(line: &str) -> Option<JsonRpcResponse> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    if value.get("method").is_some() {
        return None;
    }
    serde_json::from_value(value).ok()
}

/// Keep the last few KB of stderr so startup failures can be explained.
///
/// Reads until EOF so the child never sees a closed stderr pipe.
async fn drain_stderr(stderr: ChildStderr, tail: Arc<StdMutex<String>>) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    while let Ok(n) = reader.read_until(b'\n', &mut line).await {
        if n == 0 {
            break;
        }
        let mut buf = lock(&tail);
        buf.push_str(&String::from_utf8_lossy(&line));
        if buf.len() > STDERR_TAIL_BYTES {
            let mut cut = buf.len() - STDERR_TAIL_BYTES;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
        drop(buf);
        line.clear();
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).waiters.remove(&self.id);
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
