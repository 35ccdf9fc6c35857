//! In-memory backends for unit tests.
//!
//! A fake backend answers JSON-RPC over a `tokio::io::duplex` pipe and
//! records every message it receives.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use super::client::aggregator_identity;
use super::lifecycle::{bring_up_connection, BackendConnection};
use super::transport::StdioTransport;
use super::types::{BackendSpec, JsonRpcError, ToolDescriptor};

/// What the fake does with a request.
pub(crate) enum Reply {
    Result(Value),
    Error(JsonRpcError),
    /// Never answer (simulates a hung backend).
    Silent,
    /// Close both pipes without answering (simulates a crash).
    Hangup,
}

pub(crate) type Handler = Arc<dyn Fn(&str, Option<&Value>) -> Reply + Send + Sync>;

/// Messages received by a fake backend, in arrival order.
#[derive(Clone, Default)]
pub(crate) struct Recorded(Arc<Mutex<Vec<(String, Option<Value>)>>>);

impl Recorded {
    pub(crate) fn methods(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    pub(crate) fn calls(&self) -> Vec<Value> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == "tools/call")
            .map(|(_, p)| p.clone().unwrap_or(Value::Null))
            .collect()
    }
}

/// Spawn a fake backend and return a transport connected to it.
pub(crate) fn fake_transport(name: &str, handler: Handler) -> (StdioTransport, Recorded) {
    let (ours, theirs) = tokio::io::duplex(256 * 1024);
    let (our_read, our_write) = tokio::io::split(ours);
    let (their_read, mut their_write) = tokio::io::split(theirs);
    let recorded = Recorded::default();
    let log = recorded.clone();

    tokio::spawn(async move {
        let mut lines = BufReader::new(their_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(msg) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let method = msg["method"].as_str().unwrap_or_default().to_string();
            let params = msg.get("params").cloned();
            log.0.lock().unwrap().push((method.clone(), params.clone()));

            let Some(id) = msg.get("id").cloned() else {
                continue;
            };
            let body = match handler(&method, params.as_ref()) {
                Reply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                Reply::Error(error) => json!({"jsonrpc": "2.0", "id": id, "error": error}),
                Reply::Silent => continue,
                Reply::Hangup => break,
            };
            let mut out = body.to_string();
            out.push('\n');
            if their_write.write_all(out.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    (StdioTransport::new(name, our_write, our_read), recorded)
}

/// A well-behaved backend exposing `tools`; `tools/call` echoes its params.
pub(crate) fn catalog_handler(tools: Vec<ToolDescriptor>) -> Handler {
    Arc::new(move |method: &str, params: Option<&Value>| match method {
        "initialize" => Reply::Result(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "fake", "version": "0.0.1"}
        })),
        "tools/list" => Reply::Result(json!({ "tools": tools })),
        "tools/call" => Reply::Result(json!({
            "content": [{"type": "text", "text": "ok"}],
            "echo": params.cloned().unwrap_or(Value::Null)
        })),
        _ => Reply::Error(JsonRpcError {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        }),
    })
}

/// Descriptors named `names`, each with a short description.
pub(crate) fn tools(names: &[&str]) -> Vec<ToolDescriptor> {
    names
        .iter()
        .map(|n| ToolDescriptor::new(n, &format!("{n} tool")))
        .collect()
}

/// A Ready connection to a well-behaved fake backend exposing `names`.
pub(crate) async fn ready_connection(spec: BackendSpec, names: &[&str]) -> (BackendConnection, Recorded) {
    let (transport, recorded) = fake_transport(&spec.name, catalog_handler(tools(names)));
    let conn = BackendConnection::from_transport(&spec, transport);
    match bring_up_connection(
        conn,
        &aggregator_identity(),
        Duration::from_secs(5),
        &CancellationToken::new(),
    )
    .await
    {
        Ok(conn) => (conn, recorded),
        Err(e) => panic!("fake backend '{}' failed to come up: {e}", spec.name),
    }
}
