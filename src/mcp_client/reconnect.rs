//! Automatic reconnection with exponential backoff.
//!
//! When a session enters `Reconnecting` it spawns one controller task. The
//! task sleeps `min(base * factor^(k-1), max)` before attempt `k`, asks the
//! session to connect, and stops on the first success. Once `max_attempts`
//! fail the session is moved to `Failed` and nothing is retried until a
//! caller asks for it.
//!
//! The task holds only a `Weak` reference to its session and is aborted by
//! `Session::close` and by an explicit `Session::connect`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;

use super::errors::McpError;
use super::session::{Session, TaskGuard};
use super::types::BackoffConfig;

// ─── BackoffPolicy ───────────────────────────────────────────────────────────

/// Delay schedule for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_millis(config.base_ms),
            factor: config.factor,
            max: Duration::from_millis(config.max_ms),
            max_attempts: config.max_attempts,
        }
    }

    /// Delay before the 1-based `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.base.as_secs_f64() * self.factor.powi(exp);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled)
    }

    /// The full schedule, one delay per allowed attempt.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).map(|attempt| self.delay_for_attempt(attempt))
    }
}

// ─── ReconnectController ─────────────────────────────────────────────────────

/// Result of a single reconnect attempt, as seen by the controller.
#[derive(Debug)]
pub(crate) enum AttemptOutcome {
    Connected,
    /// The session was closed or reconnected by someone else; stop quietly.
    Abandoned,
    Failed(McpError),
}

/// Per-session reconnect bookkeeping.
#[derive(Debug)]
pub struct ReconnectController {
    policy: BackoffPolicy,
    /// Attempts made in the current (or most recent) cycle.
    attempts: AtomicU32,
    /// Number of reconnect cycles started over the session's lifetime.
    cycles: AtomicU64,
}

impl ReconnectController {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU32::new(0),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn begin_cycle(&self) {
        self.attempts.store(0, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    fn record_attempt(&self, attempt: u32) {
        self.attempts.store(attempt, Ordering::Relaxed);
    }
}

/// Controller task body for one reconnect cycle.
pub(crate) async fn run(session: Weak<Session>, cycle: u64, _guard: TaskGuard) {
    let (server_id, policy) = match session.upgrade() {
        Some(s) => (s.server_id().to_string(), *s.reconnect_controller().policy()),
        None => return,
    };

    let mut last_error: Option<McpError> = None;
    for attempt in 1..=policy.max_attempts {
        let delay = policy.delay_for_attempt(attempt);
        tracing::info!(
            server = %server_id,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect attempt"
        );
        tokio::time::sleep(delay).await;

        let Some(session) = session.upgrade() else {
            return;
        };
        session.reconnect_controller().record_attempt(attempt);

        match session.reconnect_attempt(cycle).await {
            AttemptOutcome::Connected => {
                tracing::info!(server = %server_id, attempt, "reconnected");
                return;
            }
            AttemptOutcome::Abandoned => {
                tracing::debug!(server = %server_id, attempt, "reconnect cycle abandoned");
                return;
            }
            AttemptOutcome::Failed(e) => {
                tracing::warn!(
                    server = %server_id,
                    attempt,
                    error = %e,
                    "reconnect attempt failed"
                );
                last_error = Some(e);
            }
        }
    }

    if let Some(session) = session.upgrade() {
        session.finish_reconnect_exhausted(cycle, policy.max_attempts, last_error);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
