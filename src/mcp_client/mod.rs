//! MCP Client — reliable connections to MCP tool servers.
//!
//! This module handles:
//! - One `Session` state machine per registered server
//! - Heartbeat pings with a consecutive-failure threshold
//! - Automatic reconnection with capped exponential backoff
//! - Rolling latency statistics for pings and tool calls
//! - A `ServerManager` that owns the sessions and picks a primary
//!
//! The wire protocol sits behind the `McpTransport`/`McpConnection` traits;
//! `DefaultTransport` speaks JSON-RPC over child-process stdio or HTTP.

pub mod config;
pub mod errors;
pub mod heartbeat;
pub mod http;
pub mod latency;
pub mod manager;
pub mod reconnect;
pub mod session;
pub mod stdio;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-exports for convenience
pub use config::{load_servers_config, McpServersConfig, SessionSettings};
pub use errors::McpError;
pub use heartbeat::{HeartbeatMonitor, HeartbeatRecord};
pub use latency::{LatencyStats, LatencyTracker};
pub use manager::ServerManager;
pub use reconnect::{BackoffPolicy, ReconnectController};
pub use session::Session;
pub use transport::{DefaultTransport, McpConnection, McpTransport};
pub use types::{
    BackoffConfig, OpKind, ServerConfig, ServerSummary, SessionState, ToolCallResult,
    ToolDescriptor, TransportSpec,
};
