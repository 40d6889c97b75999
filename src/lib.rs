//! Connection reliability for MCP tool servers.
//!
//! Register servers with a [`ServerManager`]; each one gets a [`Session`] that
//! heartbeats, reconnects with backoff, and records latency. Callers ask the
//! manager for the primary session or route tool calls by server id.

pub mod logging;
pub mod mcp_client;

pub use mcp_client::{
    load_servers_config, McpError, OpKind, ServerConfig, ServerManager, Session, SessionState,
};
