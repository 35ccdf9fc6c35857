//! Front-end request dispatcher.
//!
//! Turns one inbound JSON-RPC line into at most one response. Requests get
//! exactly one response; notifications get none.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::mcp_client::lifecycle::PROTOCOL_VERSION;
use crate::mcp_client::types::{error_codes, ClientMessage, ServerResponse};
use crate::mcp_client::Aggregator;

/// Answers the front-end's MCP methods from the aggregated catalog.
pub struct Dispatcher {
    aggregator: Arc<Aggregator>,
    /// Protocol version advertised regardless of what the client asks for.
    protocol_override: Option<String>,
}

impl Dispatcher {
    pub fn new(aggregator: Arc<Aggregator>, protocol_override: Option<String>) -> Self {
        Self {
            aggregator,
            protocol_override,
        }
    }

    /// Handle one inbound line.
    pub async fn handle_line(&self, line: &str) -> Option<ServerResponse> {
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "unparsable front-end message");
                return Some(ServerResponse::error(
                    Value::Null,
                    error_codes::PARSE_ERROR,
                    format!("Parse error: {e}"),
                    None,
                ));
            }
        };

        if !value.is_object() {
            tracing::warn!(kind = json_kind(&value), "front-end message is not an object");
            let message = if value.is_array() {
                "Invalid request: batch requests are not supported"
            } else {
                "Invalid request: expected a JSON object"
            };
            return Some(ServerResponse::error(
                Value::Null,
                error_codes::INVALID_REQUEST,
                message,
                None,
            ));
        }

        let id = value.get("id").cloned().filter(|id| !id.is_null());
        let message: ClientMessage = match serde_json::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                // A message without an id (e.g. a stray response) gets no reply.
                let id = id?;
                return Some(ServerResponse::error(
                    id,
                    error_codes::INVALID_REQUEST,
                    format!("Invalid request: {e}"),
                    None,
                ));
            }
        };

        match message.id {
            Some(id) => Some(self.handle_request(id, &message.method, message.params).await),
            None => {
                self.handle_notification(&message.method);
                None
            }
        }
    }

    async fn handle_request(&self, id: Value, method: &str, params: Option<Value>) -> ServerResponse {
        tracing::debug!(%id, method, "front-end request");

        match method {
            "initialize" => ServerResponse::success(id, self.initialize(params.as_ref())),
            "ping" => ServerResponse::success(id, json!({})),
            "tools/list" => {
                let tools = self.aggregator.list_tools().await;
                tracing::debug!(count = tools.len(), "serving tool catalog");
                ServerResponse::success(id, json!({ "tools": tools }))
            }
            "tools/call" => self.call_tool(id, params).await,
            other => {
                tracing::debug!(method = other, "unsupported method");
                ServerResponse::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                    None,
                )
            }
        }
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => tracing::info!("front-end session initialized"),
            "notifications/cancelled" => {
                tracing::debug!("front-end cancelled a request (ignored)")
            }
            other => tracing::debug!(method = other, "ignoring notification"),
        }
    }

    fn initialize(&self, params: Option<&Value>) -> Value {
        let requested = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str);
        if let Some(client) = params.and_then(|p| p.get("clientInfo")) {
            let field = |key: &str| {
                client
                    .get(key)
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("?")
            };
            tracing::info!(
                client_name = field("name"),
                client_version = field("version"),
                requested_version = requested.unwrap_or("?"),
                "front-end initialize"
            );
        }

        let version = self
            .protocol_override
            .as_deref()
            .or(requested)
            .unwrap_or(PROTOCOL_VERSION);
        if self.protocol_override.is_some() {
            tracing::info!(version, "advertising overridden protocol version");
        }

        json!({
            "protocolVersion": version,
            "capabilities": { "tools": { "listChanged": false } },
            "serverInfo": self.aggregator.identity(),
        })
    }

    async fn call_tool(&self, id: Value, params: Option<Value>) -> ServerResponse {
        let Some(Value::Object(mut params)) = params else {
            return ServerResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "Invalid params: expected an object with a tool name",
                None,
            );
        };
        let name = match params.remove("name") {
            Some(Value::String(name)) => name,
            _ => {
                return ServerResponse::error(
                    id,
                    error_codes::INVALID_PARAMS,
                    "Invalid params: missing tool name",
                    None,
                )
            }
        };
        let arguments = params.remove("arguments");

        tracing::info!(tool = %name, %id, "tool call");
        match self.aggregator.call_tool(&name, arguments).await {
            Ok(result) => {
                let is_error = result.get("isError").and_then(Value::as_bool).unwrap_or(false);
                tracing::info!(tool = %name, success = !is_error, "tool call result");
                ServerResponse::success(id, result)
            }
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "tool call failed");
                ServerResponse::error(id, e.rpc_code(), e.rpc_message(), e.rpc_data())
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
