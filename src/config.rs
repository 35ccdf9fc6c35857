//! Configuration: the backend list file and environment knobs.
//!
//! Everything is resolved once at startup into an ordered, validated
//! `Vec<BackendSpec>` plus [`Settings`]; the core never re-reads either.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::mcp_client::lifecycle::DEFAULT_INIT_TIMEOUT;
use crate::mcp_client::client::DEFAULT_CALL_TIMEOUT;
use crate::mcp_client::{BackendSpec, McpError, SupervisorSettings};

/// Path of the backend list file.
pub const CONFIG_ENV: &str = "MCP_CONFIG";
/// Log verbosity (`error|warn|info|debug|trace` or `0..=3`).
pub const LOG_LEVEL_ENV: &str = "MCP_LOG_LEVEL";
/// Optional log file; stderr when unset.
pub const LOG_FILE_ENV: &str = "MCP_LOG_FILE";
/// `json` for one JSON object per log event; anything else is plain text.
pub const LOG_FORMAT_ENV: &str = "MCP_LOG_FORMAT";
pub const INIT_TIMEOUT_ENV: &str = "MCP_INIT_TIMEOUT_SECS";
pub const CALL_TIMEOUT_ENV: &str = "MCP_CALL_TIMEOUT_SECS";
/// Protocol version to advertise to the front-end instead of the negotiated one.
pub const PROTOCOL_VERSION_ENV: &str = "MCP_PROTOCOL_VERSION";

// ─── Settings ────────────────────────────────────────────────────────────────

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Parse a level name or its numeric form; anything else means Info.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" | "0" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "info" | "1" => LogLevel::Info,
            "debug" | "2" => LogLevel::Debug,
            "trace" | "3" => LogLevel::Trace,
            _ => LogLevel::Info,
        }
    }

    /// Directive understood by `EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Process-wide settings read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: Option<PathBuf>,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
    pub log_json: bool,
    pub init_timeout: Duration,
    pub call_timeout: Duration,
    pub protocol_override: Option<String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            config_path: get(CONFIG_ENV).map(|p| expand_home(&p)),
            log_level: get(LOG_LEVEL_ENV)
                .map(|v| LogLevel::parse(&v))
                .unwrap_or(LogLevel::Info),
            log_file: get(LOG_FILE_ENV).map(|p| expand_home(&p)),
            log_json: get(LOG_FORMAT_ENV).is_some_and(|f| f.trim().eq_ignore_ascii_case("json")),
            init_timeout: get(INIT_TIMEOUT_ENV)
                .and_then(|v| parse_secs(&v))
                .unwrap_or(DEFAULT_INIT_TIMEOUT),
            call_timeout: get(CALL_TIMEOUT_ENV)
                .and_then(|v| parse_secs(&v))
                .unwrap_or(DEFAULT_CALL_TIMEOUT),
            protocol_override: get(PROTOCOL_VERSION_ENV),
        }
    }

    pub fn supervisor(&self) -> SupervisorSettings {
        SupervisorSettings {
            init_timeout: self.init_timeout,
            call_timeout: self.call_timeout,
        }
    }

    /// Load the backend list named by `MCP_CONFIG`.
    pub fn load_backends(&self) -> Result<Vec<BackendSpec>, McpError> {
        let path = self.config_path.as_deref().ok_or_else(|| McpError::ConfigError {
            reason: format!("environment variable {CONFIG_ENV} not set"),
        })?;
        load_config(path)
    }
}

/// Positive whole seconds; zero and garbage are rejected.
fn parse_secs(value: &str) -> Option<Duration> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => None,
    }
}

/// Expand a leading `~/` to the home directory.
fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// ─── Config File ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    servers: Vec<RawServer>,
    #[serde(default, rename = "mcpServers")]
    mcp_servers: BTreeMap<String, RawServer>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    #[serde(default)]
    name: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    tools: Option<RawTools>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTools {
    #[serde(default)]
    allowed: Option<Vec<String>>,
}

impl RawServer {
    fn into_spec(self) -> BackendSpec {
        BackendSpec {
            name: self.name,
            command: self.command,
            args: self.args,
            env: self.env,
            allowed_tools: self.tools.and_then(|t| t.allowed),
        }
    }
}

/// Read and validate a config file. YAML by `.yaml`/`.yml` extension, else JSON.
pub fn load_config(path: &Path) -> Result<Vec<BackendSpec>, McpError> {
    let content = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("error reading config file {}: {e}", path.display()),
    })?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

    let specs = if is_yaml {
        parse_yaml(&content)?
    } else {
        parse_json(&content)?
    };

    tracing::debug!(
        path = %path.display(),
        servers = specs.len(),
        "configuration loaded"
    );
    Ok(specs)
}

/// Parse and validate JSON config text.
pub fn parse_json(content: &str) -> Result<Vec<BackendSpec>, McpError> {
    let raw: RawConfig = serde_json::from_str(content).map_err(|e| McpError::ConfigError {
        reason: format!("error parsing config file: {e}"),
    })?;
    build_specs(raw)
}

/// Parse and validate YAML config text.
pub fn parse_yaml(content: &str) -> Result<Vec<BackendSpec>, McpError> {
    let raw: RawConfig = serde_yaml::from_str(content).map_err(|e| McpError::ConfigError {
        reason: format!("error parsing config file: {e}"),
    })?;
    build_specs(raw)
}

fn build_specs(raw: RawConfig) -> Result<Vec<BackendSpec>, McpError> {
    let specs: Vec<BackendSpec> = if !raw.servers.is_empty() {
        raw.servers.into_iter().map(RawServer::into_spec).collect()
    } else {
        // Map keys are the names; BTreeMap keeps them sorted.
        raw.mcp_servers
            .into_iter()
            .map(|(name, mut server)| {
                server.name = name;
                server.into_spec()
            })
            .collect()
    };

    validate(&specs)?;
    Ok(specs)
}

fn validate(specs: &[BackendSpec]) -> Result<(), McpError> {
    let fail = |reason: String| Err(McpError::ConfigError { reason });

    if specs.is_empty() {
        return fail("no servers defined in config".into());
    }

    let mut seen = HashSet::new();
    for (i, spec) in specs.iter().enumerate() {
        if spec.name.trim().is_empty() {
            return fail(format!("server at index {i} missing name"));
        }
        if spec.command.trim().is_empty() {
            return fail(format!("server {} missing command", spec.name));
        }
        if !seen.insert(spec.name.as_str()) {
            return fail(format!("duplicate server name: {}", spec.name));
        }
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
