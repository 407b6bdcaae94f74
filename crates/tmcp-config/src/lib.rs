//! Environment-variable configuration.
//!
//! The service is configured entirely through environment variables (no
//! config files). [`ServerConfig::from_env`] reads the process environment;
//! [`ServerConfig::from_lookup`] takes a closure so tests can construct
//! configurations without mutating process-global state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;
use std::path::PathBuf;
use tracing::warn;

/// Default HTTP port.
pub const DEFAULT_PORT: u16 = 8443;
/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";
/// Default requests-per-minute budget per identity.
pub const DEFAULT_RATE_LIMIT: u32 = 60;
/// Default accumulated-response cap in KiB.
pub const DEFAULT_MAX_RESPONSE_SIZE_KB: u64 = 1024;
/// Default SSE heartbeat interval in milliseconds.
pub const DEFAULT_SSE_HEARTBEAT_MS: u64 = 25_000;
/// Concurrent in-flight requests on the stdio transport.
pub const MAX_INFLIGHT_STDIO: usize = 16;
/// Concurrent in-flight requests on the HTTP transport.
pub const MAX_INFLIGHT_HTTP: usize = 100;
/// Maximum simultaneously open streaming connections.
pub const MAX_OPEN_STREAMS: usize = 100;

/// Problems found while reading the environment. Every problem is listed,
/// not just the first.
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration: {problems:?}")]
pub struct ConfigError {
    /// Individual validation failure messages.
    pub problems: Vec<String>,
}

/// Recognised log levels.
const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

/// Runtime settings shared by both binaries.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Bind host for the HTTP transport.
    pub host: String,
    /// Bind port for the HTTP transport.
    pub port: u16,
    /// TLS certificate path; accepted for completeness, termination is
    /// delegated to the fronting proxy.
    pub tls_cert: Option<PathBuf>,
    /// TLS key path; see `tls_cert`.
    pub tls_key: Option<PathBuf>,
    /// Accepted bearer tokens; empty disables authentication.
    pub auth_tokens: Vec<String>,
    /// CORS origin patterns (`*` wildcards supported).
    pub allowed_origins: Vec<String>,
    /// Requests per minute per identity.
    pub rate_limit_per_minute: u32,
    /// Accumulated-response cap in KiB.
    pub max_response_size_kb: u64,
    /// SSE heartbeat interval in milliseconds.
    pub sse_heartbeat_ms: u64,
    /// Sandbox root.
    pub working_directory: PathBuf,
    /// Log level (`debug`, `info`, `warn`, `error`).
    pub log_level: String,
    /// Version string recorded in receipts under `toolVersions.taskMcp`.
    pub task_mcp_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls_cert: None,
            tls_key: None,
            auth_tokens: Vec::new(),
            allowed_origins: vec!["*".to_string()],
            rate_limit_per_minute: DEFAULT_RATE_LIMIT,
            max_response_size_kb: DEFAULT_MAX_RESPONSE_SIZE_KB,
            sse_heartbeat_ms: DEFAULT_SSE_HEARTBEAT_MS,
            working_directory: PathBuf::from("."),
            log_level: "info".to_string(),
            task_mcp_version: "dev".to_string(),
        }
    }
}

impl ServerConfig {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] listing every unparseable or out-of-range value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup` (tests inject their own).
    ///
    /// # Errors
    ///
    /// [`ConfigError`] listing every unparseable or out-of-range value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut problems = Vec::new();
        let mut config = Self::default();

        if let Some(host) = lookup("HOST") {
            config.host = host;
        }
        parse_into(&lookup, "PORT", &mut config.port, &mut problems);
        config.tls_cert = lookup("TLS_CERT").map(PathBuf::from);
        config.tls_key = lookup("TLS_KEY").map(PathBuf::from);
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            problems.push("TLS_CERT and TLS_KEY must be set together".to_string());
        }

        if let Some(raw) = lookup("AUTH_TOKENS") {
            config.auth_tokens = split_csv(&raw);
        }
        if let Some(raw) = lookup("ALLOWED_ORIGINS") {
            config.allowed_origins = split_csv(&raw);
        }

        parse_into(
            &lookup,
            "RATE_LIMIT",
            &mut config.rate_limit_per_minute,
            &mut problems,
        );
        if config.rate_limit_per_minute == 0 {
            problems.push("RATE_LIMIT must be positive".to_string());
        }
        parse_into(
            &lookup,
            "MAX_RESPONSE_SIZE_KB",
            &mut config.max_response_size_kb,
            &mut problems,
        );
        parse_into(
            &lookup,
            "SSE_HEARTBEAT_MS",
            &mut config.sse_heartbeat_ms,
            &mut problems,
        );

        if let Some(dir) = lookup("WORKING_DIRECTORY") {
            config.working_directory = PathBuf::from(dir);
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            if LOG_LEVELS.contains(&level.as_str()) {
                config.log_level = level;
            } else {
                problems.push(format!(
                    "LOG_LEVEL {level:?} is not one of {LOG_LEVELS:?}"
                ));
            }
        }
        if let Some(version) = lookup("TASK_MCP_VERSION") {
            config.task_mcp_version = version;
        }

        if problems.is_empty() {
            if config.tls_cert.is_some() {
                warn!("TLS_CERT is set but TLS termination is delegated; serving plain HTTP");
            }
            Ok(config)
        } else {
            Err(ConfigError { problems })
        }
    }

    /// Whether authentication is enabled (any token configured).
    pub fn auth_enabled(&self) -> bool {
        !self.auth_tokens.is_empty()
    }

    /// The accumulated-response cap in bytes.
    pub fn max_response_bytes(&self) -> u64 {
        self.max_response_size_kb * 1024
    }

    /// Burst allowance of the token bucket: `ceil(1.5 × rate)`.
    pub fn burst_limit(&self) -> u32 {
        self.rate_limit_per_minute
            .saturating_mul(3)
            .div_ceil(2)
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
    problems: &mut Vec<String>,
) {
    if let Some(raw) = lookup(key) {
        match raw.parse() {
            Ok(value) => *slot = value,
            Err(_) => problems.push(format!("{key} {raw:?} is not a valid number")),
        }
    }
}
