//! MCP Client error types.

use thiserror::Error;

use super::types::error_codes;

/// Errors that can occur while supervising backends and routing tool calls.
#[derive(Debug, Error)]
pub enum McpError {
    /// A backend process failed to start.
    #[error("failed to spawn backend '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The initialization handshake failed or timed out.
    #[error("backend '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// The backend reached Ready but its tool catalog could not be listed.
    #[error("backend '{name}' tool discovery failed: {reason}")]
    DiscoveryFailed { name: String, reason: String },

    /// JSON-RPC communication error (malformed message, I/O error, closed pipe).
    #[error("transport error for backend '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// Backend returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Public tool name is not in the registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// A tool call timed out.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    Timeout { tool: String, timeout_ms: u64 },

    /// The owning backend is no longer running.
    #[error("backend '{name}' crashed: {reason}")]
    ServerCrashed { name: String, reason: String },

    /// Configuration error (missing servers, bad config file).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// Not a single configured backend reached Ready.
    #[error("no backends were successfully initialized ({attempted} attempted)")]
    AllBackendsFailed { attempted: usize },

    /// Backend bring-up was interrupted by shutdown.
    #[error("backend '{name}' startup cancelled")]
    Cancelled { name: String },
}

impl McpError {
    /// JSON-RPC error code used when this error is reported to the front-end.
    pub fn rpc_code(&self) -> i32 {
        match self {
            McpError::ServerError { code, .. } => *code,
            McpError::UnknownTool { .. } => error_codes::INVALID_PARAMS,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// JSON-RPC error message; backend errors keep their original wording.
    pub fn rpc_message(&self) -> String {
        match self {
            McpError::ServerError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Extra `data` payload, forwarded untouched from backend errors.
    pub fn rpc_data(&self) -> Option<serde_json::Value> {
        match self {
            McpError::ServerError { data, .. } => data.clone(),
            _ => None,
        }
    }
}
