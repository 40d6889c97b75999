//! Server configuration loading, validation, and defaults.
//!
//! Config files mirror the common `mcpServers` layout:
//!
//! ```json
//! { "mcpServers": { "fs": { "command": "npx", "args": ["-y", "server-fs"] },
//!                   "remote": { "url": "https://mcp.example.com/rpc", "ping_interval_ms": 10000 } } }
//! ```
//!
//! `.yaml`/`.yml` files are parsed as YAML, everything else as JSON. Server
//! order in the file is preserved; it decides primary-session selection.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use super::errors::McpError;
use super::latency::DEFAULT_LATENCY_CAPACITY;
use super::reconnect::BackoffPolicy;
use super::types::{BackoffConfig, ServerConfig, TransportSpec};

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Interval between heartbeat pings. Zero disables the heartbeat.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Time a single ping may take before it counts as a failure.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive ping failures before the session is reconnected.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Timeout for establishing a connection and completing the handshake.
///
/// Generous because some stdio servers import heavy frameworks at startup.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for `tools/call` and `tools/list`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// ─── SessionSettings ─────────────────────────────────────────────────────────

/// Effective timing parameters for one session, after applying defaults.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub failure_threshold: u32,
    pub connect_timeout: Duration,
    pub call_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub latency_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            backoff: BackoffPolicy::from_config(&BackoffConfig::default()),
            latency_capacity: DEFAULT_LATENCY_CAPACITY,
        }
    }
}

impl SessionSettings {
    /// Resolve per-server overrides on top of `self`.
    pub fn apply(&self, config: &ServerConfig) -> Self {
        let ms = Duration::from_millis;
        Self {
            ping_interval: config.ping_interval_ms.map_or(self.ping_interval, ms),
            ping_timeout: config.ping_timeout_ms.map_or(self.ping_timeout, ms),
            failure_threshold: config.failure_threshold.unwrap_or(self.failure_threshold),
            connect_timeout: config.connect_timeout_ms.map_or(self.connect_timeout, ms),
            call_timeout: config.call_timeout_ms.map_or(self.call_timeout, ms),
            backoff: config
                .backoff
                .as_ref()
                .map_or(self.backoff, BackoffPolicy::from_config),
            latency_capacity: self.latency_capacity,
        }
    }

}

// ─── Validation ──────────────────────────────────────────────────────────────

/// Check one server definition in isolation (duplicate ids are the
/// manager's concern).
pub fn validate_server_config(config: &ServerConfig) -> Result<(), McpError> {
    let invalid = |reason: &str| McpError::ConfigValidation {
        server: config.id.clone(),
        reason: reason.to_string(),
    };

    if config.id.trim().is_empty() {
        return Err(invalid("server id must not be empty"));
    }
    if config.id.trim() != config.id {
        return Err(invalid("server id must not have leading or trailing whitespace"));
    }

    match &config.transport {
        TransportSpec::Stdio { command, .. } => {
            if command.trim().is_empty() {
                return Err(invalid("stdio command must not be empty"));
            }
        }
        TransportSpec::Http { url } => {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| invalid(&format!("url is not a valid URL: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(invalid("url scheme must be http or https"));
            }
            if parsed.host_str().map_or(true, str::is_empty) {
                return Err(invalid("url must name a host"));
            }
        }
    }

    if config.ping_timeout_ms == Some(0) {
        return Err(invalid("ping_timeout_ms must be greater than 0"));
    }
    if config.failure_threshold == Some(0) {
        return Err(invalid("failure_threshold must be at least 1"));
    }
    if config.connect_timeout_ms == Some(0) {
        return Err(invalid("connect_timeout_ms must be greater than 0"));
    }
    if config.call_timeout_ms == Some(0) {
        return Err(invalid("call_timeout_ms must be greater than 0"));
    }

    if let Some(backoff) = &config.backoff {
        if !backoff.factor.is_finite() || backoff.factor < 1.0 {
            return Err(invalid("backoff.factor must be a finite number >= 1.0"));
        }
        if backoff.max_ms < backoff.base_ms {
            return Err(invalid("backoff.max_ms must be >= backoff.base_ms"));
        }
        if backoff.max_attempts == 0 {
            return Err(invalid("backoff.max_attempts must be at least 1"));
        }
    }

    Ok(())
}

// ─── Config File ─────────────────────────────────────────────────────────────

/// Top-level servers configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct McpServersConfig {
    /// Server definitions in file order.
    #[serde(rename = "mcpServers", deserialize_with = "ordered_servers")]
    pub servers: Vec<ServerConfig>,
}

impl McpServersConfig {
    /// Parse config text; `yaml` selects the YAML parser.
    pub fn parse(raw: &str, yaml: bool) -> Result<Self, McpError> {
        let interpolated = interpolate_env_vars(raw);
        if yaml {
            serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse config: {e}"),
            })
        } else {
            serde_json::from_str(&interpolated).map_err(|e| McpError::ConfigError {
                reason: format!("failed to parse config: {e}"),
            })
        }
    }
}

/// Load and parse a servers configuration file.
///
/// Performs environment-variable interpolation on the raw text for
/// `${VAR_NAME}` and `${VAR_NAME:-default}`.
pub fn load_servers_config(path: &Path) -> Result<McpServersConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    let yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );

    McpServersConfig::parse(&raw, yaml)
}

/// Deserialize the `mcpServers` map into a `Vec`, keeping document order and
/// filling each entry's `id` from its key.
fn ordered_servers<'de, D>(deserializer: D) -> Result<Vec<ServerConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ServersVisitor;

    impl<'de> Visitor<'de> for ServersVisitor {
        type Value = Vec<ServerConfig>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of server id to server definition")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut servers = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((id, mut config)) = map.next_entry::<String, ServerConfig>()? {
                config.id = id;
                servers.push(config);
            }
            Ok(servers)
        }
    }

    deserializer.deserialize_map(ServersVisitor)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some(idx) = expr.find(":-") {
        let var_name = &expr[..idx];
        let default = &expr[idx + 2..];
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__MCP_LINK_NONEXISTENT_VAR__");
        let input = "${__MCP_LINK_NONEXISTENT_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__MCP_LINK_TEST_VAR__", "/custom/path");
        let input = "${__MCP_LINK_TEST_VAR__:-/fallback/path}";
        assert_eq!(interpolate_env_vars(input), "/custom/path");
        std::env::remove_var("__MCP_LINK_TEST_VAR__");
    }

    #[test]
    fn test_interpolate_no_vars() {
        let input = "plain text with no variables";
        assert_eq!(interpolate_env_vars(input), input);
    }

    #[test]
    fn test_parse_json_preserves_order() {
        let raw = r#"{
            "mcpServers": {
                "zeta": {"command": "npx", "args": ["zeta"]},
                "alpha": {"url": "http://localhost:9000/mcp", "failure_threshold": 5}
            }
        }"#;
        let config = McpServersConfig::parse(raw, false).unwrap();
        let ids: Vec<&str> = config.servers.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
        assert_eq!(config.servers[1].failure_threshold, Some(5));
    }

    #[test]
    fn test_parse_yaml() {
        let raw = r#"
mcpServers:
  fs:
    command: python3
    args: ["-m", "server"]
    env:
      LOG_LEVEL: debug
    ping_interval_ms: 0
"#;
        let config = McpServersConfig::parse(raw, true).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].id, "fs");
        assert_eq!(config.servers[0].ping_interval_ms, Some(0));
        match &config.servers[0].transport {
            TransportSpec::Stdio { env, .. } => assert_eq!(env["LOG_LEVEL"], "debug"),
            other => panic!("expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_mcp_servers_key() {
        let err = McpServersConfig::parse(r#"{"servers": {}}"#, false).unwrap_err();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_servers_config(Path::new("/nonexistent/mcp-servers.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"mcpServers": {{"echo": {{"command": "echo-server"}}}}}}"#
        )
        .unwrap();
        let config = load_servers_config(file.path()).unwrap();
        assert_eq!(config.servers[0].id, "echo");
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let config = ServerConfig::stdio("", "npx", &[]);
        assert!(matches!(
            validate_server_config(&config),
            Err(McpError::ConfigValidation { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_blank_command() {
        let config = ServerConfig::stdio("fs", "  ", &[]);
        assert!(validate_server_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_unreachable_urls() {
        for url in [
            "localhost:8080",
            "http://",
            "http://exa mple.com/mcp",
            "http://?",
            "https://:99999/x",
            "ftp://example.com/mcp",
            "file:///tmp/mcp.sock",
        ] {
            assert!(
                matches!(
                    validate_server_config(&ServerConfig::http("web", url)),
                    Err(McpError::ConfigValidation { .. })
                ),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_accepts_http_urls() {
        for url in [
            "http://localhost:8080",
            "https://mcp.example.com/rpc",
            "http://127.0.0.1:9000/mcp?token=abc",
        ] {
            assert!(validate_server_config(&ServerConfig::http("web", url)).is_ok(), "{url}");
        }
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = ServerConfig::stdio("fs", "npx", &[]);
        config.backoff = Some(BackoffConfig {
            base_ms: 1_000,
            factor: 0.5,
            max_ms: 30_000,
            max_attempts: 3,
        });
        assert!(validate_server_config(&config).is_err());

        config.backoff = Some(BackoffConfig {
            base_ms: 5_000,
            factor: 2.0,
            max_ms: 1_000,
            max_attempts: 3,
        });
        assert!(validate_server_config(&config).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = ServerConfig::stdio("fs", "npx", &[]);
        config.failure_threshold = Some(0);
        assert!(validate_server_config(&config).is_err());
    }

    #[test]
    fn test_settings_apply_overrides() {
        let mut config = ServerConfig::stdio("fs", "npx", &[]);
        config.ping_interval_ms = Some(50);
        config.failure_threshold = Some(5);
        let settings = SessionSettings::default().apply(&config);
        assert_eq!(settings.ping_interval, Duration::from_millis(50));
        assert_eq!(settings.failure_threshold, 5);
        assert_eq!(settings.ping_timeout, DEFAULT_PING_TIMEOUT);
        assert_eq!(settings.backoff, SessionSettings::default().backoff);
    }
}
