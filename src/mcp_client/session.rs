//! Session — one logical connection to one MCP server.
//!
//! State, generation, counters and the transport handle sit behind a single
//! `std::sync::Mutex` that is never held across an `.await`. Every operation
//! captures the generation when it starts and only applies its outcome if the
//! generation is unchanged when it settles, so a late answer from a superseded
//! connection cannot touch current state.
//!
//! Generation is bumped when a connect attempt starts, when the session
//! enters `Reconnecting`, and on close. Connect attempts are additionally
//! serialized by an async gate, so at most one is in flight per session.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::config::SessionSettings;
use super::errors::McpError;
use super::heartbeat::{self, HeartbeatMonitor};
use super::latency::{LatencyStats, LatencyTracker};
use super::reconnect::{self, AttemptOutcome, ReconnectController};
use super::transport::{McpConnection, McpTransport};
use super::types::{OpKind, ServerConfig, ServerSummary, SessionState, ToolCallResult, ToolDescriptor};

// ─── Task Accounting ─────────────────────────────────────────────────────────

/// Counts live background tasks (heartbeat, reconnect) owned by a session.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskCounter(Arc<AtomicUsize>);

impl TaskCounter {
    fn guard(&self) -> TaskGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        TaskGuard(Arc::clone(&self.0))
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Moved into a spawned task; decrements the counter when the task's future
/// is dropped, whether it finished or was aborted.
#[derive(Debug)]
pub(crate) struct TaskGuard(Arc<AtomicUsize>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectMode {
    /// Caller-requested connect: failure moves the session to `Failed`.
    Explicit,
    /// Attempt issued by the reconnect controller for the given cycle:
    /// failure leaves the session in `Reconnecting`.
    Reconnect { cycle: u64 },
}

struct SessionInner {
    state: SessionState,
    connection: Option<Arc<dyn McpConnection>>,
    generation: u64,
    consecutive_failures: u32,
    last_ping_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    tool_count: Option<usize>,
    reconnect_cycle: u64,
    heartbeat_task: Option<JoinHandle<()>>,
    reconnect_task: Option<JoinHandle<()>>,
}

/// A single server's connection state machine.
pub struct Session {
    config: ServerConfig,
    settings: SessionSettings,
    transport: Arc<dyn McpTransport>,
    inner: Mutex<SessionInner>,
    connect_gate: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<SessionState>,
    latency: LatencyTracker,
    heartbeat: HeartbeatMonitor,
    reconnect: ReconnectController,
    tasks: TaskCounter,
}

impl Session {
    /// Create a disconnected session. Call `start` to launch its heartbeat.
    pub fn new(
        config: ServerConfig,
        settings: SessionSettings,
        transport: Arc<dyn McpTransport>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Arc::new(Self {
            heartbeat: HeartbeatMonitor::new(
                settings.ping_interval,
                settings.ping_timeout,
                settings.failure_threshold,
            ),
            reconnect: ReconnectController::new(settings.backoff),
            latency: LatencyTracker::new(settings.latency_capacity),
            config,
            settings,
            transport,
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                connection: None,
                generation: 0,
                consecutive_failures: 0,
                last_ping_at: None,
                last_error: None,
                tool_count: None,
                reconnect_cycle: 0,
                heartbeat_task: None,
                reconnect_task: None,
            }),
            connect_gate: tokio::sync::Mutex::new(()),
            state_tx,
            tasks: TaskCounter::default(),
        })
    }

    /// Launch the heartbeat task (no-op when the interval is zero or the
    /// heartbeat is already running).
    pub fn start(self: &Arc<Self>) {
        if !self.heartbeat.is_enabled() {
            tracing::debug!(server = %self.server_id(), "heartbeat disabled");
            return;
        }
        let mut inner = self.lock();
        if inner.state == SessionState::Closed || inner.heartbeat_task.is_some() {
            return;
        }
        let guard = self.tasks.guard();
        inner.heartbeat_task = Some(tokio::spawn(heartbeat::run(
            Arc::downgrade(self),
            self.heartbeat.interval(),
            guard,
        )));
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn server_id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn last_ping_at(&self) -> Option<DateTime<Utc>> {
        self.lock().last_ping_at
    }

    /// Watch state transitions as they are applied.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn latency_stats(&self, kind: OpKind) -> LatencyStats {
        self.latency.stats(kind)
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn reconnect_controller(&self) -> &ReconnectController {
        &self.reconnect
    }

    /// Background tasks (heartbeat, reconnect) still alive for this session.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.get()
    }

    pub fn summary(&self) -> ServerSummary {
        let inner = self.lock();
        ServerSummary {
            server_id: self.config.id.clone(),
            endpoint: self.config.transport.endpoint().to_string(),
            state: inner.state,
            generation: inner.generation,
            consecutive_failures: inner.consecutive_failures,
            last_ping_at: inner.last_ping_at,
            last_error: inner.last_error.clone(),
            tool_count: inner.tool_count,
            reconnect_attempts: self.reconnect.attempts(),
            pending_tasks: self.tasks.get(),
        }
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Connect (or retry out of `Failed`).
    ///
    /// A no-op when already usable. From `Reconnecting` the pending reconnect
    /// attempt is cancelled and a connect is made immediately.
    pub async fn connect(&self) -> Result<(), McpError> {
        let pending_reconnect = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Closed => return Err(self.not_ready(&inner)),
                SessionState::Connected | SessionState::Degraded => return Ok(()),
                SessionState::Reconnecting => {
                    inner.reconnect_cycle += 1;
                    inner.reconnect_task.take()
                }
                _ => None,
            }
        };

        if let Some(task) = pending_reconnect {
            task.abort();
            let _ = task.await;
            tracing::info!(server = %self.server_id(), "pending reconnect cancelled by explicit connect");
        }

        self.connect_with(ConnectMode::Explicit).await
    }

    async fn connect_with(&self, mode: ConnectMode) -> Result<(), McpError> {
        let _gate = self.connect_gate.lock().await;

        let generation = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return Err(self.not_ready(&inner));
            }
            match mode {
                ConnectMode::Reconnect { cycle } => {
                    if inner.state != SessionState::Reconnecting || inner.reconnect_cycle != cycle {
                        return Err(McpError::Superseded {
                            server: self.config.id.clone(),
                        });
                    }
                }
                ConnectMode::Explicit => {
                    if inner.state.is_usable() {
                        return Ok(());
                    }
                    self.transition(&mut inner, SessionState::Connecting);
                }
            }
            inner.generation += 1;
            inner.generation
        };

        tracing::info!(
            server = %self.server_id(),
            endpoint = self.config.transport.endpoint(),
            generation,
            "connecting to MCP server"
        );

        let timeout = self.settings.connect_timeout;
        let result = tokio::time::timeout(
            timeout,
            self.transport.connect(&self.config.id, &self.config.transport),
        )
        .await
        .unwrap_or_else(|_| {
            Err(McpError::ConnectionTimeout {
                server: self.config.id.clone(),
                operation: "connect",
                timeout_ms: timeout.as_millis() as u64,
            })
        });

        match result {
            Ok(conn) => {
                let accepted = {
                    let mut inner = self.lock();
                    if inner.generation == generation && inner.state != SessionState::Closed {
                        inner.connection = Some(Arc::clone(&conn));
                        inner.consecutive_failures = 0;
                        inner.last_error = None;
                        self.transition(&mut inner, SessionState::Connected);
                        true
                    } else {
                        false
                    }
                };

                if !accepted {
                    tracing::warn!(
                        server = %self.server_id(),
                        generation,
                        "discarding connection from superseded attempt"
                    );
                    conn.close().await;
                    return Err(McpError::Superseded {
                        server: self.config.id.clone(),
                    });
                }

                tracing::info!(server = %self.server_id(), generation, "MCP session connected");
                Ok(())
            }
            Err(e) => {
                let mut inner = self.lock();
                if inner.generation == generation && inner.state != SessionState::Closed {
                    inner.last_error = Some(e.to_string());
                    if mode == ConnectMode::Explicit {
                        self.transition(&mut inner, SessionState::Failed);
                    }
                }
                drop(inner);
                tracing::warn!(server = %self.server_id(), generation, error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// One attempt on behalf of the reconnect controller.
    pub(crate) async fn reconnect_attempt(&self, cycle: u64) -> AttemptOutcome {
        match self.connect_with(ConnectMode::Reconnect { cycle }).await {
            Ok(()) => AttemptOutcome::Connected,
            Err(McpError::Superseded { .. }) | Err(McpError::NotReady { .. }) => {
                AttemptOutcome::Abandoned
            }
            Err(e) => AttemptOutcome::Failed(e),
        }
    }

    /// Called by the controller once every attempt of `cycle` has failed.
    pub(crate) fn finish_reconnect_exhausted(
        &self,
        cycle: u64,
        attempts: u32,
        last_error: Option<McpError>,
    ) {
        let mut inner = self.lock();
        if inner.state != SessionState::Reconnecting || inner.reconnect_cycle != cycle {
            return;
        }
        let exhausted = McpError::ReconnectExhausted {
            server: self.config.id.clone(),
            attempts,
        };
        inner.last_error = Some(match last_error {
            Some(e) => format!("{exhausted}: {e}"),
            None => exhausted.to_string(),
        });
        inner.reconnect_task = None;
        self.transition(&mut inner, SessionState::Failed);
        drop(inner);
        tracing::error!(server = %self.server_id(), attempts, "giving up on reconnect");
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Check liveness. Failures count toward the reconnect threshold.
    pub async fn ping(self: &Arc<Self>) -> Result<Duration, McpError> {
        let (conn, generation) = self.usable_connection()?;
        let timeout = self.settings.ping_timeout;

        let start = Instant::now();
        let result = tokio::time::timeout(timeout, conn.ping())
            .await
            .unwrap_or_else(|_| {
                Err(McpError::ConnectionTimeout {
                    server: self.config.id.clone(),
                    operation: "ping",
                    timeout_ms: timeout.as_millis() as u64,
                })
            });
        let elapsed = start.elapsed();

        match result {
            Ok(()) => {
                self.latency.record_success(OpKind::Ping, elapsed);
                self.mark_alive(generation, true);
                Ok(elapsed)
            }
            Err(e) => {
                self.latency.record_failure(OpKind::Ping);
                if let Some(dropped) = self.apply_ping_failure(generation, &e) {
                    dropped.close().await;
                }
                Err(e)
            }
        }
    }

    /// Fetch the server's tool catalogue.
    pub async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let (conn, generation) = self.usable_connection()?;
        let timeout = self.settings.call_timeout;

        let tools = tokio::time::timeout(timeout, conn.list_tools())
            .await
            .unwrap_or_else(|_| {
                Err(McpError::ConnectionTimeout {
                    server: self.config.id.clone(),
                    operation: "tools/list",
                    timeout_ms: timeout.as_millis() as u64,
                })
            })?;

        {
            let mut inner = self.lock();
            if inner.generation == generation {
                inner.tool_count = Some(tools.len());
            }
        }
        self.mark_alive(generation, false);
        Ok(tools)
    }

    /// Invoke a tool. Transport failures come back as errors but never move
    /// the session's state; only the heartbeat decides liveness.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, McpError> {
        let (conn, generation) = self.usable_connection()?;
        let timeout = self.settings.call_timeout;

        let start = Instant::now();
        let result = tokio::time::timeout(timeout, conn.call_tool(tool_name, arguments)).await;
        let elapsed = start.elapsed();

        let tool_result = |success: bool, result, error| ToolCallResult {
            server_id: self.config.id.clone(),
            tool_name: tool_name.to_string(),
            success,
            result,
            error,
            execution_time_ms: elapsed.as_millis() as u64,
        };

        match result {
            Ok(Ok(value)) => {
                self.latency.record_success(OpKind::ToolCall, elapsed);
                self.mark_alive(generation, false);
                Ok(tool_result(true, Some(value), None))
            }
            // The tool ran and reported an error: the link itself is fine
            Ok(Err(McpError::ServerError { code, message, .. })) => {
                self.latency.record_success(OpKind::ToolCall, elapsed);
                self.mark_alive(generation, false);
                Ok(tool_result(false, None, Some(format!("[{code}] {message}"))))
            }
            Ok(Err(e)) => {
                self.latency.record_failure(OpKind::ToolCall);
                Err(McpError::ToolInvocation {
                    server: self.config.id.clone(),
                    tool: tool_name.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.latency.record_failure(OpKind::ToolCall);
                Err(McpError::ConnectionTimeout {
                    server: self.config.id.clone(),
                    operation: "tools/call",
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    // ─── Close ───────────────────────────────────────────────────────────

    /// Move to `Closed`, cancel background tasks, and release the transport.
    ///
    /// Returns once the heartbeat and reconnect tasks have terminated.
    /// Idempotent.
    pub async fn close(&self) {
        let (conn, heartbeat_task, reconnect_task) = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return;
            }
            inner.generation += 1;
            inner.reconnect_cycle += 1;
            self.transition(&mut inner, SessionState::Closed);
            (
                inner.connection.take(),
                inner.heartbeat_task.take(),
                inner.reconnect_task.take(),
            )
        };

        for task in [heartbeat_task, reconnect_task].into_iter().flatten() {
            task.abort();
            let _ = task.await;
        }

        if let Some(conn) = conn {
            conn.close().await;
        }

        tracing::info!(server = %self.server_id(), "MCP session closed");
    }

    // ─── Internals ───────────────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut SessionInner, next: SessionState) {
        if inner.state == next {
            return;
        }
        tracing::debug!(
            server = %self.config.id,
            from = %inner.state,
            to = %next,
            generation = inner.generation,
            "session state transition"
        );
        inner.state = next;
        self.state_tx.send_replace(next);
    }

    fn not_ready(&self, inner: &SessionInner) -> McpError {
        McpError::NotReady {
            server: self.config.id.clone(),
            state: inner.state,
            last_error: inner.last_error.clone(),
        }
    }

    fn usable_connection(&self) -> Result<(Arc<dyn McpConnection>, u64), McpError> {
        let inner = self.lock();
        match &inner.connection {
            Some(conn) if inner.state.is_usable() => Ok((Arc::clone(conn), inner.generation)),
            _ => Err(self.not_ready(&inner)),
        }
    }

    /// Record a liveness signal from an operation started under `generation`.
    fn mark_alive(&self, generation: u64, pinged: bool) {
        let mut inner = self.lock();
        if inner.generation != generation || !inner.state.is_usable() {
            return;
        }
        inner.consecutive_failures = 0;
        if pinged {
            inner.last_ping_at = Some(Utc::now());
        }
        if inner.state == SessionState::Degraded {
            self.transition(&mut inner, SessionState::Connected);
            drop(inner);
            tracing::info!(server = %self.server_id(), "session recovered");
        }
    }

    /// Count a failed ping. Returns the connection to release if the
    /// threshold was crossed and the session moved to `Reconnecting`.
    fn apply_ping_failure(
        self: &Arc<Self>,
        generation: u64,
        error: &McpError,
    ) -> Option<Arc<dyn McpConnection>> {
        let mut inner = self.lock();
        if inner.generation != generation || !inner.state.is_usable() {
            return None;
        }

        inner.consecutive_failures += 1;
        inner.last_error = Some(error.to_string());
        let failures = inner.consecutive_failures;

        if failures < self.settings.failure_threshold {
            self.transition(&mut inner, SessionState::Degraded);
            drop(inner);
            tracing::warn!(
                server = %self.server_id(),
                failures,
                threshold = self.settings.failure_threshold,
                error = %error,
                "ping failed; session degraded"
            );
            return None;
        }

        tracing::warn!(
            server = %self.config.id,
            failures,
            error = %error,
            "failure threshold reached; reconnecting"
        );
        self.begin_reconnect(&mut inner)
    }

    fn begin_reconnect(self: &Arc<Self>, inner: &mut SessionInner) -> Option<Arc<dyn McpConnection>> {
        inner.consecutive_failures = 0;
        inner.generation += 1;
        inner.reconnect_cycle += 1;
        let cycle = inner.reconnect_cycle;
        let dropped = inner.connection.take();
        self.transition(inner, SessionState::Reconnecting);

        self.reconnect.begin_cycle();
        if let Some(old) = inner.reconnect_task.take() {
            old.abort();
        }
        let guard = self.tasks.guard();
        inner.reconnect_task = Some(tokio::spawn(reconnect::run(
            Arc::downgrade(self),
            cycle,
            guard,
        )));
        dropped
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in [inner.heartbeat_task.take(), inner.reconnect_task.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("server_id", &self.config.id)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("consecutive_failures", &inner.consecutive_failures)
            .finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::*;
    use crate::mcp_client::test_support::{
        eventually, fast_settings, wait_for_state, CallMode, FakeServer, FakeTransport,
    };

    fn session_with(settings: SessionSettings) -> (Arc<Session>, Arc<FakeServer>) {
        let transport = FakeTransport::new();
        let server = transport.server("fs");
        let session = Session::new(ServerConfig::stdio("fs", "fake-mcp", &[]), settings, transport);
        (session, server)
    }

    async fn connected(settings: SessionSettings) -> (Arc<Session>, Arc<FakeServer>) {
        let (session, server) = session_with(settings);
        session.connect().await.unwrap();
        (session, server)
    }

    #[tokio::test]
    async fn test_connect_then_ping() {
        let (session, _server) = session_with(fast_settings(0, 3, 10));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.generation(), 0);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.generation(), 1);

        session.ping().await.unwrap();
        assert!(session.last_ping_at().is_some());
        assert_eq!(session.latency_stats(OpKind::Ping).count, 1);
    }

    #[tokio::test]
    async fn test_connect_when_usable_is_noop() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        session.connect().await.unwrap();
        assert_eq!(FakeServer::count(&server.connects), 1);
        assert_eq!(session.generation(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_marks_failed_and_can_retry() {
        let (session, server) = session_with(fast_settings(0, 3, 10));
        server.fail_connects(true);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.last_error().unwrap().contains("connection refused"));

        let err = session.ping().await.unwrap_err();
        match err {
            McpError::NotReady { state, last_error, .. } => {
                assert_eq!(state, SessionState::Failed);
                assert!(last_error.is_some());
            }
            other => panic!("expected NotReady, got {other:?}"),
        }

        server.fail_connects(false);
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.last_error().is_none());
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let mut settings = fast_settings(0, 3, 10);
        settings.connect_timeout = Duration::from_millis(30);
        let (session, server) = session_with(settings);
        server.connect_delay_ms.store(500, Ordering::SeqCst);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionTimeout { operation: "connect", .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_requests_rejected_before_connect() {
        let (session, _server) = session_with(fast_settings(0, 3, 10));
        assert!(matches!(
            session.ping().await,
            Err(McpError::NotReady { state: SessionState::Disconnected, .. })
        ));
        assert!(matches!(
            session.call_tool("echo", json!({})).await,
            Err(McpError::NotReady { .. })
        ));
        assert!(matches!(session.list_tools().await, Err(McpError::NotReady { .. })));
    }

    #[tokio::test]
    async fn test_ping_failures_degrade_then_reconnect() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        server.fail_pings(true);

        session.ping().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Degraded);
        assert_eq!(session.consecutive_failures(), 1);

        session.ping().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Degraded);
        assert_eq!(session.consecutive_failures(), 2);

        session.ping().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(session.consecutive_failures(), 0);
        assert_eq!(session.generation(), 2);
        assert_eq!(FakeServer::count(&server.closes), 1, "old connection released");

        server.fail_pings(false);
        wait_for_state(&session, SessionState::Connected).await;
        assert_eq!(session.generation(), 3);
        assert_eq!(session.reconnect_controller().attempts(), 1);
        assert_eq!(session.reconnect_controller().cycles(), 1);
        session.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_ping_success_recovers_degraded() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        server.fail_pings(true);
        session.ping().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Degraded);

        server.fail_pings(false);
        session.ping().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_ping_timeout_counts_as_failure() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        server.ping_hangs.store(true, Ordering::SeqCst);

        let err = session.ping().await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionTimeout { operation: "ping", .. }));
        assert_eq!(session.consecutive_failures(), 1);
        assert_eq!(session.latency_stats(OpKind::Ping).failures, 1);
    }

    #[tokio::test]
    async fn test_tool_success_resets_failures() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        server.fail_pings(true);
        session.ping().await.unwrap_err();
        session.ping().await.unwrap_err();
        assert_eq!(session.consecutive_failures(), 2);

        let result = session.call_tool("fs.echo", json!({ "x": 1 })).await.unwrap();
        assert!(result.success);
        assert_eq!(result.server_id, "fs");
        assert_eq!(result.result.unwrap()["arguments"]["x"], 1);
        assert_eq!(session.consecutive_failures(), 0);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_tool_error_is_a_completed_round_trip() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        server.set_call_mode(CallMode::ToolError);

        let result = session.call_tool("fs.echo", json!({})).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("[-32000] boom"));
        assert_eq!(session.latency_stats(OpKind::ToolCall).count, 1);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_tool_transport_failure_leaves_state_alone() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        server.set_call_mode(CallMode::TransportFail);

        let err = session.call_tool("fs.echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ToolInvocation { ref tool, .. } if tool == "fs.echo"));
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.consecutive_failures(), 0);

        let stats = session.latency_stats(OpKind::ToolCall);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.count, 0);
    }

    #[tokio::test]
    async fn test_tool_timeout() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        server.set_call_mode(CallMode::Hang);

        let err = session.call_tool("fs.echo", json!({})).await.unwrap_err();
        assert!(matches!(err, McpError::ConnectionTimeout { operation: "tools/call", .. }));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_list_tools_records_count() {
        let (session, _server) = connected(fast_settings(0, 3, 10)).await;
        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(session.summary().tool_count, Some(2));
    }

    #[tokio::test]
    async fn test_reconnect_exhaustion_marks_failed() {
        let (session, server) = connected(fast_settings(0, 1, 5)).await;
        server.fail_pings(true);
        server.fail_connects(true);

        session.ping().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Reconnecting);

        wait_for_state(&session, SessionState::Failed).await;
        assert_eq!(FakeServer::count(&server.connects), 4, "initial connect plus 3 attempts");
        let last_error = session.last_error().unwrap();
        assert!(last_error.contains("failed after 3 reconnect attempts"), "{last_error}");
        eventually(|| session.pending_tasks() == 0).await;

        // Nothing retries on its own once failed
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(FakeServer::count(&server.connects), 4);
    }

    #[tokio::test]
    async fn test_explicit_connect_cancels_pending_reconnect() {
        let (session, server) = connected(fast_settings(0, 1, 10_000)).await;
        server.fail_pings(true);
        session.ping().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Reconnecting);
        assert_eq!(session.pending_tasks(), 1);

        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(session.pending_tasks(), 0);
        assert_eq!(FakeServer::count(&server.connects), 2);
    }

    #[tokio::test]
    async fn test_close_mid_reconnect_leaves_no_tasks() {
        let (session, server) = connected(fast_settings(20, 1, 10_000)).await;
        server.fail_pings(true);
        session.start();

        wait_for_state(&session, SessionState::Reconnecting).await;
        assert_eq!(session.pending_tasks(), 2, "heartbeat plus reconnect");

        let generation = session.generation();
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.pending_tasks(), 0);
        assert!(session.generation() > generation);

        assert!(matches!(
            session.ping().await,
            Err(McpError::NotReady { state: SessionState::Closed, .. })
        ));
        assert!(matches!(session.connect().await, Err(McpError::NotReady { .. })));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, server) = connected(fast_settings(20, 3, 10)).await;
        session.start();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(FakeServer::count(&server.closes), 1);
        assert_eq!(session.pending_tasks(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_disabled_at_zero_interval() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        session.start();
        assert_eq!(session.pending_tasks(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(FakeServer::count(&server.pings), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_pings_periodically() {
        let (session, server) = connected(fast_settings(20, 3, 10)).await;
        session.start();
        eventually(|| FakeServer::count(&server.pings) >= 3).await;

        let record = session.heartbeat().record();
        assert!(record.pings_sent >= 3);
        assert_eq!(record.pings_failed, 0);
        session.close().await;
    }

    #[tokio::test]
    async fn test_stale_connect_result_is_discarded() {
        let (session, server) = session_with(fast_settings(0, 3, 10));
        let release = server.hold_next_connect();

        let connecting = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.connect().await })
        };
        eventually(|| FakeServer::count(&server.connects_in_flight) == 1).await;
        assert_eq!(session.state(), SessionState::Connecting);

        session.close().await;
        release.notify_one();

        let result = connecting.await.unwrap();
        assert!(matches!(result, Err(McpError::Superseded { .. })));
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(FakeServer::count(&server.closes), 1, "late connection released");
    }

    #[tokio::test]
    async fn test_stale_ping_result_is_ignored() {
        let mut settings = fast_settings(0, 2, 5);
        settings.ping_timeout = Duration::from_secs(5);
        let (session, server) = connected(settings).await;
        let release = server.hold_next_ping();

        let stale_ping = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.ping().await })
        };
        eventually(|| FakeServer::count(&server.pings) == 1).await;

        // Two failures push generation 1 into a reconnect, which lands on generation 3
        server.fail_pings(true);
        session.ping().await.unwrap_err();
        session.ping().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Reconnecting);
        server.fail_pings(false);
        wait_for_state(&session, SessionState::Connected).await;
        assert_eq!(session.generation(), 3);

        server.fail_pings(true);
        session.ping().await.unwrap_err();
        assert_eq!(session.state(), SessionState::Degraded);
        assert_eq!(session.consecutive_failures(), 1);

        // The held ping fails on its closed generation-1 connection
        release.notify_one();
        assert!(stale_ping.await.unwrap().is_err());
        assert_eq!(session.state(), SessionState::Degraded);
        assert_eq!(session.consecutive_failures(), 1);
        assert_eq!(session.generation(), 3);
    }

    #[tokio::test]
    async fn test_at_most_one_connect_in_flight() {
        let (session, server) = session_with(fast_settings(0, 3, 10));
        server.connect_delay_ms.store(30, Ordering::SeqCst);

        let attempts: Vec<_> = (0..5)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.connect().await })
            })
            .collect();
        for attempt in attempts {
            attempt.await.unwrap().unwrap();
        }

        assert_eq!(FakeServer::count(&server.max_connects_in_flight), 1);
        assert_eq!(FakeServer::count(&server.connects), 1);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_subscribe_observes_transitions() {
        let (session, _server) = session_with(fast_settings(0, 3, 10));
        let rx = session.subscribe();
        assert_eq!(*rx.borrow(), SessionState::Disconnected);
        session.connect().await.unwrap();
        assert_eq!(*rx.borrow(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_summary_reflects_session() {
        let (session, server) = connected(fast_settings(0, 3, 10)).await;
        server.fail_pings(true);
        session.ping().await.unwrap_err();

        let summary = session.summary();
        assert_eq!(summary.server_id, "fs");
        assert_eq!(summary.endpoint, "fake-mcp");
        assert_eq!(summary.state, SessionState::Degraded);
        assert_eq!(summary.consecutive_failures, 1);
        assert!(summary.last_error.unwrap().contains("broken pipe"));
    }
}
