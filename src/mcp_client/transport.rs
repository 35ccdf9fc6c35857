//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with one backend:
//! - Writing JSON-RPC requests and notifications to its stdin
//! - Reading JSON-RPC responses from its stdout on a background task
//! - Matching responses to in-flight requests by `id`, so any number of
//!   requests can be outstanding on the same backend at once
//!
//! Line-delimited JSON protocol (one JSON object per line).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ─── Pending Requests ────────────────────────────────────────────────────────

/// Requests waiting for a response, plus the reason the channel closed (if it did).
#[derive(Default)]
struct PendingTable {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: Option<String>,
}

type SharedPending = Arc<StdMutex<PendingTable>>;

/// Removes a waiter when its request future is dropped (timeout, cancellation).
struct WaiterGuard<'a> {
    pending: &'a SharedPending,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut table) = self.pending.lock() {
            table.waiters.remove(&self.id);
        }
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a backend's private stdio pair.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<BoxedWriter>,
    pending: SharedPending,
    next_id: AtomicU64,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport over any writer/reader pair (child stdio, in-memory pipe).
    ///
    /// Spawns the response reader, so this must be called inside a Tokio runtime.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: SharedPending = Arc::new(StdMutex::new(PendingTable::default()));
        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            Box::new(reader) as BoxedReader,
            Arc::clone(&pending),
        ));

        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            reader_task,
        }
    }

    /// Whether the backend's output channel has closed.
    pub fn is_closed(&self) -> bool {
        self.pending
            .lock()
            .map(|table| table.closed.is_some())
            .unwrap_or(true)
    }

    /// Send a JSON-RPC request and wait for the response carrying the same `id`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);

        let line = serde_json::to_string(&req).map_err(|e| self.transport_error(format!(
            "failed to serialize request: {e}"
        )))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self
                .pending
                .lock()
                .map_err(|e| self.transport_error(format!("pending table poisoned: {e}")))?;
            if let Some(reason) = &table.closed {
                return Err(self.transport_error(reason.clone()));
            }
            table.waiters.insert(id, tx);
        }
        let _guard = WaiterGuard {
            pending: &self.pending,
            id,
        };

        tracing::trace!(backend = %self.server_name, message = %line, "-> backend");
        self.write_line(line).await?;

        rx.await.map_err(|_| {
            let reason = self
                .pending
                .lock()
                .ok()
                .and_then(|table| table.closed.clone())
                .unwrap_or_else(|| "response channel dropped".into());
            self.transport_error(reason)
        })
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&notification).map_err(|e| {
            self.transport_error(format!("failed to serialize notification: {e}"))
        })?;
        tracing::trace!(backend = %self.server_name, message = %line, "-> backend");
        self.write_line(line).await
    }

    /// Close the backend's input. Well-behaved backends exit on EOF.
    pub async fn close(&self) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer
            .shutdown()
            .await
            .map_err(|e| self.transport_error(format!("failed to close stdin: {e}")))
    }

    async fn write_line(&self, mut line: String) -> Result<(), McpError> {
        line.push('\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ─── Reader ──────────────────────────────────────────────────────────────────

/// Read backend stdout until EOF, handing each response to its waiter.
///
/// Lines that are not UTF-8 are skipped like any other noise. On exit every
/// outstanding request is failed and new requests are refused.
async fn read_loop(server_name: String, reader: BoxedReader, pending: SharedPending) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let reason = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break "backend stdout closed (process may have exited)".to_string(),
            Ok(_) => {
                let Ok(line) = std::str::from_utf8(&buf) else {
                    tracing::debug!(
                        backend = %server_name,
                        output = %String::from_utf8_lossy(&buf).trim(),
                        "skipping non-UTF-8 backend output"
                    );
                    continue;
                };
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                tracing::trace!(backend = %server_name, message = %trimmed, "<- backend");
                route_line(&server_name, trimmed, &pending);
            }
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };

    tracing::debug!(backend = %server_name, reason = %reason, "backend channel closed");
    if let Ok(mut table) = pending.lock() {
        table.closed = Some(reason);
        // Dropping the senders wakes every waiter with an error.
        table.waiters.clear();
    }
}

fn route_line(server_name: &str, line: &str, pending: &SharedPending) {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            // Not JSON: stray log output from the backend.
            tracing::debug!(backend = %server_name, output = %line, "skipping non-JSON backend output");
            return;
        }
    };

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        tracing::debug!(
            backend = %server_name,
            method,
            "ignoring backend-initiated message"
        );
        return;
    }

    let response: JsonRpcResponse = match serde_json::from_value(value) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(backend = %server_name, error = %e, "skipping malformed response");
            return;
        }
    };

    let Some(id) = response.id.as_u64() else {
        tracing::debug!(backend = %server_name, id = %response.id, "response with foreign id");
        return;
    };

    let waiter = pending
        .lock()
        .ok()
        .and_then(|mut table| table.waiters.remove(&id));
    match waiter {
        Some(tx) => {
            let _ = tx.send(response);
        }
        None => {
            tracing::debug!(backend = %server_name, id, "response for abandoned request");
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: -32603,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
