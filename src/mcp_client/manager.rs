//! Server Manager — registry of sessions and the public entry point.
//!
//! Owns one `Session` per registered server in registration order, exposes the
//! primary session, and routes tool calls and lookups by server id. The
//! registry lock is a std `RwLock` held only to snapshot or edit the list;
//! no I/O happens under it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::join_all;

use super::config::{validate_server_config, SessionSettings};
use super::errors::McpError;
use super::latency::LatencyStats;
use super::session::Session;
use super::transport::{DefaultTransport, McpTransport};
use super::types::{OpKind, ServerConfig, ServerSummary, SessionState, ToolCallResult, ToolDescriptor};

// ─── ServerManager ───────────────────────────────────────────────────────────

/// Registry of MCP sessions keyed by server id.
pub struct ServerManager {
    transport: Arc<dyn McpTransport>,
    /// Settings applied before each server's own overrides.
    defaults: SessionSettings,
    /// Sessions in registration order.
    sessions: RwLock<Vec<Arc<Session>>>,
    shut_down: AtomicBool,
}

impl Default for ServerManager {
    fn default() -> Self {
        Self::new(Arc::new(DefaultTransport::new()))
    }
}

impl ServerManager {
    /// Create a manager using `transport` and the default timings.
    pub fn new(transport: Arc<dyn McpTransport>) -> Self {
        Self::with_settings(transport, SessionSettings::default())
    }

    /// Create a manager whose sessions start from `defaults`.
    pub fn with_settings(transport: Arc<dyn McpTransport>, defaults: SessionSettings) -> Self {
        Self {
            transport,
            defaults,
            sessions: RwLock::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn defaults(&self) -> &SessionSettings {
        &self.defaults
    }

    // ─── Registration ────────────────────────────────────────────────────

    /// Validate, register, and eagerly connect one server.
    ///
    /// A failed eager connect does not fail registration: the session stays
    /// `Failed` and the error surfaces on first use.
    pub async fn register_server(&self, config: ServerConfig) -> Result<Arc<Session>, McpError> {
        let session = self.insert_session(config)?;
        let _ = self.activate(&session).await;
        Ok(session)
    }

    /// Register an ordered batch, connecting the accepted servers concurrently.
    ///
    /// Returns the servers that were rejected or failed their eager connect
    /// (partial startup is OK).
    pub async fn register_all(&self, configs: Vec<ServerConfig>) -> Vec<(String, McpError)> {
        let mut errors = Vec::new();
        let mut accepted = Vec::new();

        for config in configs {
            let id = config.id.clone();
            match self.insert_session(config) {
                Ok(session) => accepted.push(session),
                Err(e) => errors.push((id, e)),
            }
        }

        let results = join_all(accepted.iter().map(|session| self.activate(session))).await;
        for (session, result) in accepted.iter().zip(results) {
            if let Err(e) = result {
                errors.push((session.server_id().to_string(), e));
            }
        }

        tracing::info!(
            registered = accepted.len(),
            failed = errors.len(),
            "MCP servers registered"
        );
        errors
    }

    /// Remove a server and close its session.
    pub async fn unregister_server(&self, server_id: &str) -> Result<(), McpError> {
        let session = {
            let mut sessions = self.write();
            let index = sessions
                .iter()
                .position(|s| s.server_id() == server_id)
                .ok_or_else(|| unknown(server_id))?;
            sessions.remove(index)
        };

        session.close().await;
        tracing::info!(server = %server_id, "MCP server unregistered");
        Ok(())
    }

    /// Explicitly connect a server again (e.g. out of `Failed`).
    pub async fn reconnect(&self, server_id: &str) -> Result<(), McpError> {
        self.session(server_id)?.connect().await
    }

    // ─── Lookup ──────────────────────────────────────────────────────────

    /// First session in registration order that is `Connected` or `Degraded`.
    pub fn get_primary_session(&self) -> Result<Arc<Session>, McpError> {
        self.read()
            .iter()
            .find(|s| s.state().is_usable())
            .cloned()
            .ok_or(McpError::NoAvailableSession)
    }

    pub fn get_session(&self, server_id: &str) -> Option<Arc<Session>> {
        self.read()
            .iter()
            .find(|s| s.server_id() == server_id)
            .cloned()
    }

    pub fn get_session_state(&self, server_id: &str) -> Result<SessionState, McpError> {
        Ok(self.session(server_id)?.state())
    }

    pub fn get_latency_stats(&self, server_id: &str, kind: OpKind) -> Result<LatencyStats, McpError> {
        Ok(self.session(server_id)?.latency_stats(kind))
    }

    /// Registered server ids in registration order.
    pub fn server_ids(&self) -> Vec<String> {
        self.read().iter().map(|s| s.server_id().to_string()).collect()
    }

    /// Liveness summary for every registered server, in registration order.
    pub fn summary(&self) -> Vec<ServerSummary> {
        self.snapshot().iter().map(|s| s.summary()).collect()
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    pub async fn list_tools(&self, server_id: &str) -> Result<Vec<ToolDescriptor>, McpError> {
        self.session(server_id)?.list_tools().await
    }

    /// Tools of every server in registration order. A server that cannot
    /// answer contributes an empty list.
    pub async fn list_all_tools(&self) -> Vec<(String, Vec<ToolDescriptor>)> {
        let sessions = self.snapshot();
        let results = join_all(sessions.iter().map(|s| s.list_tools())).await;

        sessions
            .iter()
            .zip(results)
            .map(|(session, result)| {
                let tools = result.unwrap_or_else(|e| {
                    tracing::warn!(
                        server = %session.server_id(),
                        error = %e,
                        "failed to list tools"
                    );
                    Vec::new()
                });
                (session.server_id().to_string(), tools)
            })
            .collect()
    }

    /// Execute a tool on the named server.
    pub async fn call_tool(
        &self,
        server_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let session = self.session(server_id)?;
        let result = session.call_tool(tool_name, arguments).await;
        if let Err(e) = &result {
            tracing::warn!(server = %server_id, tool = %tool_name, error = %e, "tool call failed");
        }
        result
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Close every session. Idempotent; later registrations are rejected.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let sessions = self.snapshot();
        tracing::info!(servers = sessions.len(), "shutting down MCP sessions");
        join_all(sessions.iter().map(|s| s.close())).await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn insert_session(&self, config: ServerConfig) -> Result<Arc<Session>, McpError> {
        if self.is_shut_down() {
            return Err(McpError::ShutDown);
        }
        validate_server_config(&config)?;

        let settings = self.defaults.apply(&config);
        let mut sessions = self.write();
        if sessions.iter().any(|s| s.server_id() == config.id) {
            return Err(McpError::ConfigValidation {
                server: config.id,
                reason: "a server with this id is already registered".into(),
            });
        }

        let session = Session::new(config, settings, Arc::clone(&self.transport));
        sessions.push(Arc::clone(&session));
        drop(sessions);

        tracing::info!(
            server = %session.server_id(),
            endpoint = session.config().transport.endpoint(),
            ping_interval_ms = settings.ping_interval.as_millis() as u64,
            "registered MCP server"
        );
        Ok(session)
    }

    /// Eager connect, then start the heartbeat regardless of the outcome.
    async fn activate(&self, session: &Arc<Session>) -> Result<(), McpError> {
        let result = session.connect().await;
        if let Err(e) = &result {
            tracing::warn!(
                server = %session.server_id(),
                error = %e,
                "eager connect failed; session left in failed state"
            );
        }
        session.start();
        result
    }

    fn session(&self, server_id: &str) -> Result<Arc<Session>, McpError> {
        self.get_session(server_id).ok_or_else(|| unknown(server_id))
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.read().clone()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn unknown(server_id: &str) -> McpError {
    McpError::UnknownServer {
        server: server_id.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
