//! Minimal stdio MCP server used as a backend in tests.
//!
//! Exposes `echo` and `add`. Prints a non-JSON line on stdout at startup so
//! clients must tolerate noise on the channel.

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use combine_mcp::mcp_client::types::{error_codes, ClientMessage, ServerResponse};

const SERVER_NAME: &str = "test-server";
const PROTOCOL_VERSION: &str = "2024-11-05";

fn tool_catalog() -> Value {
    json!([
        {
            "name": "echo",
            "description": "Echo back the input message",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "message": {"type": "string", "description": "Message to echo back"}
                },
                "required": ["message"]
            }
        },
        {
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": {"type": "number", "description": "First number"},
                    "b": {"type": "number", "description": "Second number"}
                },
                "required": ["a", "b"]
            }
        }
    ])
}

fn text_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": text}],
        "isError": is_error,
    })
}

fn call_tool(params: Option<&Value>) -> Result<Value, String> {
    let name = params
        .and_then(|p| p.get("name"))
        .and_then(Value::as_str)
        .ok_or("missing tool name")?;
    let args = params.and_then(|p| p.get("arguments"));
    let arg = |key: &str| args.and_then(|a| a.get(key));

    let result = match name {
        "echo" => match arg("message").and_then(Value::as_str) {
            Some(message) => text_result(format!("Echo: {message}"), false),
            None => text_result("message must be a string".into(), true),
        },
        "add" => match (
            arg("a").and_then(Value::as_f64),
            arg("b").and_then(Value::as_f64),
        ) {
            (Some(a), Some(b)) => text_result(format!("Result: {}", a + b), false),
            _ => text_result("a and b must be numbers".into(), true),
        },
        other => return Err(format!("unknown tool: {other}")),
    };
    Ok(result)
}

fn handle(message: ClientMessage) -> Option<ServerResponse> {
    let id = message.id?;
    let response = match message.method.as_str() {
        "initialize" => ServerResponse::success(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")}
            }),
        ),
        "ping" => ServerResponse::success(id, json!({})),
        "tools/list" => ServerResponse::success(id, json!({ "tools": tool_catalog() })),
        "tools/call" => match call_tool(message.params.as_ref()) {
            Ok(result) => ServerResponse::success(id, result),
            Err(reason) => ServerResponse::error(id, error_codes::INVALID_PARAMS, reason, None),
        },
        other => ServerResponse::error(
            id,
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
            None,
        ),
    };
    Some(response)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    eprintln!("{SERVER_NAME} {} starting", env!("CARGO_PKG_VERSION"));

    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"test-server: ready (not JSON)\n").await?;
    stdout.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let message: ClientMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("{SERVER_NAME}: ignoring malformed message: {e}");
                continue;
            }
        };
        let Some(response) = handle(message) else {
            continue;
        };

        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        stdout.write_all(out.as_bytes()).await?;
        stdout.flush().await?;
    }

    eprintln!("{SERVER_NAME}: stdin closed, exiting");
    Ok(())
}
