//! Periodic liveness probing.
//!
//! One heartbeat task per session pings at a fixed interval while the session
//! is `Connected` or `Degraded` and does nothing on ticks in any other state.
//! The ping is awaited inline and missed ticks are skipped, so there is never
//! more than one heartbeat ping outstanding per session.
//!
//! Failure counting and the switch to `Reconnecting` live in the session's
//! state machine, because a successful tool call resets the same counter.

use std::sync::{Mutex, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;

use super::session::{Session, TaskGuard};
use super::types::SessionState;

/// Counters kept by a session's heartbeat monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeartbeatRecord {
    pub interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub failure_threshold: u32,
    /// Ticks observed, including suspended ones.
    pub ticks: u64,
    /// Ticks that fell in a non-usable state and issued no ping.
    pub suspended_ticks: u64,
    pub pings_sent: u64,
    pub pings_failed: u64,
    pub last_latency_ms: Option<f64>,
}

/// Heartbeat configuration and bookkeeping for one session.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    interval: Duration,
    record: Mutex<HeartbeatRecord>,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, ping_timeout: Duration, failure_threshold: u32) -> Self {
        Self {
            interval,
            record: Mutex::new(HeartbeatRecord {
                interval_ms: interval.as_millis() as u64,
                ping_timeout_ms: ping_timeout.as_millis() as u64,
                failure_threshold,
                ..HeartbeatRecord::default()
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// An interval of zero disables heartbeats for the session.
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn record(&self) -> HeartbeatRecord {
        self.lock().clone()
    }

    /// Account for a tick; returns whether a ping should be issued.
    fn on_tick(&self, state: SessionState) -> bool {
        let mut record = self.lock();
        record.ticks += 1;
        if state.is_usable() {
            record.pings_sent += 1;
            true
        } else {
            record.suspended_ticks += 1;
            false
        }
    }

    fn on_ping_result(&self, latency: Option<Duration>) {
        let mut record = self.lock();
        match latency {
            Some(elapsed) => record.last_latency_ms = Some(elapsed.as_secs_f64() * 1000.0),
            None => record.pings_failed += 1,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeartbeatRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Heartbeat task body. Runs until the session is dropped or the task is
/// aborted by `Session::close`.
pub(crate) async fn run(session: Weak<Session>, interval: Duration, _guard: TaskGuard) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let Some(session) = session.upgrade() else {
            break;
        };
        let state = session.state();
        if state == SessionState::Closed {
            break;
        }
        if !session.heartbeat().on_tick(state) {
            continue;
        }

        match session.ping().await {
            Ok(elapsed) => {
                session.heartbeat().on_ping_result(Some(elapsed));
                tracing::debug!(
                    server = %session.server_id(),
                    latency_ms = elapsed.as_millis() as u64,
                    "heartbeat ok"
                );
            }
            Err(e) => {
                session.heartbeat().on_ping_result(None);
                tracing::debug!(server = %session.server_id(), error = %e, "heartbeat failed");
            }
        }
    }
}
