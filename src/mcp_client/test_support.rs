//! Scriptable in-memory transport for session and manager tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;

use super::config::SessionSettings;
use super::errors::McpError;
use super::reconnect::BackoffPolicy;
use super::session::Session;
use super::transport::{McpConnection, McpTransport};
use super::types::{SessionState, ToolDescriptor, TransportSpec};

/// How the fake answers `tools/call`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum CallMode {
    #[default]
    Echo,
    ToolError,
    TransportFail,
    Hang,
}

/// Behaviour and counters for one fake server id.
#[derive(Debug, Default)]
pub(crate) struct FakeServer {
    pub connect_fails: AtomicBool,
    pub connect_delay_ms: AtomicU64,
    connect_hold: Mutex<Option<Arc<Notify>>>,
    pub connects: AtomicUsize,
    pub connects_in_flight: AtomicUsize,
    pub max_connects_in_flight: AtomicUsize,

    pub ping_fails: AtomicBool,
    pub ping_hangs: AtomicBool,
    ping_delays: Mutex<VecDeque<Duration>>,
    ping_hold: Mutex<Option<Arc<Notify>>>,
    pub pings: AtomicUsize,

    call_mode: Mutex<CallMode>,
    pub closes: AtomicUsize,
}

impl FakeServer {
    /// Block the next connect until the returned handle is notified.
    pub fn hold_next_connect(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.connect_hold.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    /// Block the next ping until the returned handle is notified.
    pub fn hold_next_ping(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.ping_hold.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    pub fn set_ping_delays(&self, delays: impl IntoIterator<Item = Duration>) {
        *self.ping_delays.lock().unwrap() = delays.into_iter().collect();
    }

    pub fn set_call_mode(&self, mode: CallMode) {
        *self.call_mode.lock().unwrap() = mode;
    }

    pub fn fail_pings(&self, fail: bool) {
        self.ping_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_connects(&self, fail: bool) {
        self.connect_fails.store(fail, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport whose servers are `FakeServer`s keyed by server id.
#[derive(Debug, Default)]
pub(crate) struct FakeTransport {
    servers: Mutex<HashMap<String, Arc<FakeServer>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get (or create) the fake behind `server_id`.
    pub fn server(&self, server_id: &str) -> Arc<FakeServer> {
        let mut servers = self.servers.lock().unwrap();
        Arc::clone(servers.entry(server_id.to_string()).or_default())
    }
}

#[async_trait]
impl McpTransport for FakeTransport {
    async fn connect(
        &self,
        server_id: &str,
        _spec: &TransportSpec,
    ) -> Result<Arc<dyn McpConnection>, McpError> {
        let server = self.server(server_id);
        server.connects.fetch_add(1, Ordering::SeqCst);
        let now = server.connects_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        server.max_connects_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&server.connects_in_flight);

        let hold = server.connect_hold.lock().unwrap().take();
        if let Some(notify) = hold {
            notify.notified().await;
        }
        let delay = server.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if server.connect_fails.load(Ordering::SeqCst) {
            return Err(McpError::TransportError {
                server: server_id.to_string(),
                reason: "connection refused".into(),
            });
        }

        Ok(Arc::new(FakeConnection {
            server_id: server_id.to_string(),
            server: Arc::clone(&server),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeConnection {
    server_id: String,
    server: Arc<FakeServer>,
    closed: AtomicBool,
}

impl FakeConnection {
    fn check_open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: "connection closed".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl McpConnection for FakeConnection {
    async fn ping(&self) -> Result<(), McpError> {
        self.server.pings.fetch_add(1, Ordering::SeqCst);
        let hold = self.server.ping_hold.lock().unwrap().take();
        if let Some(notify) = hold {
            notify.notified().await;
        }
        self.check_open()?;
        if self.server.ping_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let delay = self.server.ping_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.server.ping_fails.load(Ordering::SeqCst) {
            return Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: "broken pipe".into(),
            });
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        self.check_open()?;
        Ok(vec![
            ToolDescriptor {
                name: format!("{}.echo", self.server_id),
                description: "Echo arguments back".into(),
                input_schema: json!({ "type": "object" }),
            },
            ToolDescriptor {
                name: format!("{}.noop", self.server_id),
                description: String::new(),
                input_schema: json!({ "type": "object" }),
            },
        ])
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        self.check_open()?;
        let mode = *self.server.call_mode.lock().unwrap();
        match mode {
            CallMode::Echo => Ok(json!({ "tool": name, "arguments": arguments })),
            CallMode::ToolError => Err(McpError::ServerError {
                code: -32000,
                message: "boom".into(),
                data: None,
            }),
            CallMode::TransportFail => Err(McpError::TransportError {
                server: self.server_id.clone(),
                reason: "broken pipe".into(),
            }),
            CallMode::Hang => std::future::pending().await,
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.server.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Fast timings for tests. `interval_ms == 0` disables the heartbeat.
pub(crate) fn fast_settings(interval_ms: u64, threshold: u32, backoff_base_ms: u64) -> SessionSettings {
    SessionSettings {
        ping_interval: Duration::from_millis(interval_ms),
        ping_timeout: Duration::from_millis(100),
        failure_threshold: threshold,
        connect_timeout: Duration::from_secs(1),
        call_timeout: Duration::from_millis(200),
        backoff: BackoffPolicy {
            base: Duration::from_millis(backoff_base_ms),
            factor: 2.0,
            max: Duration::from_secs(60),
            max_attempts: 3,
        },
        latency_capacity: 1000,
    }
}

/// Wait (bounded) until the session reports `want`.
pub(crate) async fn wait_for_state(session: &Session, want: SessionState) {
    let mut rx = session.subscribe();
    tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|state| *state == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {want}, state is {}", session.state()))
        .expect("state channel closed");
}

/// Poll until `check` passes, bounded.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
