//! Backend process lifecycle management.
//!
//! Handles spawning, initializing, discovering, and shutting down backend
//! child processes. Each backend runs as a separate OS process speaking
//! JSON-RPC over its own stdin/stdout; its stderr is drained into the
//! diagnostic log and never reaches our stdout.
//!
//! A backend moves Pending → Ready (handshake done) or Failed (terminal,
//! never retried), and finally Closed on exit or shutdown.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::transport::{extract_result, StdioTransport};
use super::types::{BackendSpec, Implementation, InitializeResult, ListToolsResult, ToolDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default bound for the initialize + discover pair.
///
/// Generous because npx-launched backends may download packages on first run.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);

/// MCP protocol revision offered in the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stderr lines kept per backend for failure messages.
const STDERR_TAIL_LINES: usize = 20;

// ─── BackendConnection ───────────────────────────────────────────────────────

/// Lifecycle state of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Pending,
    Ready,
    Failed,
    Closed,
}

/// Recent stderr output of a backend.
type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// One backend: its process, private transport, and discovered catalog.
pub struct BackendConnection {
    spec: BackendSpec,
    state: Mutex<BackendState>,
    /// The child process handle (absent for in-process transports).
    process: tokio::sync::Mutex<Option<Child>>,
    /// JSON-RPC transport (stdin/stdout).
    transport: StdioTransport,
    /// Tool definitions received during discovery.
    tools: Vec<ToolDescriptor>,
    /// Identity the backend reported in its handshake.
    server_info: Option<Implementation>,
    stderr_tail: StderrTail,
}

impl BackendConnection {
    /// Spawn the backend process described by `spec`.
    ///
    /// The connection starts out Pending; call [`initialize`](Self::initialize) next.
    pub fn start(spec: &BackendSpec) -> Result<Self, McpError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);

        // Overrides are layered onto the inherited environment.
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        // Wire stdio for JSON-RPC; stderr goes to the log, never to our stdout.
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::debug!(
            backend = %spec.name,
            command = %spec.command,
            args = ?spec.args,
            env_keys = ?spec.env.keys().collect::<Vec<_>>(),
            "spawning backend"
        );

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: spec.name.clone(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: spec.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;

        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: spec.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = StderrTail::default();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(drain_stderr(spec.name.clone(), stderr, Arc::clone(&stderr_tail)));
        }

        let transport = StdioTransport::new(&spec.name, stdin, stdout);
        let mut conn = Self::from_transport(spec, transport);
        conn.process = tokio::sync::Mutex::new(Some(child));
        conn.stderr_tail = stderr_tail;
        Ok(conn)
    }

    /// Wrap an already-connected transport (no child process to manage).
    pub fn from_transport(spec: &BackendSpec, transport: StdioTransport) -> Self {
        Self {
            spec: spec.clone(),
            state: Mutex::new(BackendState::Pending),
            process: tokio::sync::Mutex::new(None),
            transport,
            tools: Vec::new(),
            server_info: None,
            stderr_tail: StderrTail::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BackendSpec {
        &self.spec
    }

    /// Current state; a Ready backend whose stdout has closed reports Closed.
    pub fn state(&self) -> BackendState {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state == BackendState::Ready && self.transport.is_closed() {
            BackendState::Closed
        } else {
            state
        }
    }

    fn set_state(&self, state: BackendState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Tools discovered after the handshake.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn server_info(&self) -> Option<&Implementation> {
        self.server_info.as_ref()
    }

    /// Perform the MCP handshake, bounded by `timeout`.
    ///
    /// Success moves the connection to Ready; any failure moves it to Failed.
    pub async fn initialize(
        &mut self,
        identity: &Implementation,
        timeout: Duration,
    ) -> Result<(), McpError> {
        self.initialize_until(identity, Instant::now() + timeout).await
    }

    async fn initialize_until(
        &mut self,
        identity: &Implementation,
        deadline: Instant,
    ) -> Result<(), McpError> {
        let outcome = match timeout_at(deadline, self.handshake(identity)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::InitFailed {
                name: self.spec.name.clone(),
                reason: "initialization timed out".into(),
            }),
        };

        match outcome {
            Ok(info) => {
                tracing::info!(
                    backend = %self.spec.name,
                    server_name = info.as_ref().map(|i| i.name.as_str()).unwrap_or("?"),
                    server_version = info.as_ref().map(|i| i.version.as_str()).unwrap_or("?"),
                    "backend initialized"
                );
                self.server_info = info;
                self.set_state(BackendState::Ready);
                Ok(())
            }
            Err(e) => {
                self.set_state(BackendState::Failed);
                Err(self.with_stderr_context(e))
            }
        }
    }

    async fn handshake(
        &self,
        identity: &Implementation,
    ) -> Result<Option<Implementation>, McpError> {
        let init_failed = |reason: String| McpError::InitFailed {
            name: self.spec.name.clone(),
            reason,
        };

        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": identity,
        });

        tracing::debug!(backend = %self.spec.name, "sending initialize request");
        let response = self
            .transport
            .request("initialize", Some(params))
            .await
            .map_err(|e| init_failed(e.to_string()))?;
        let result = extract_result(response).map_err(|e| init_failed(e.to_string()))?;

        let init_result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| init_failed(format!("failed to parse initialize response: {e}")))?;

        if let Some(version) = &init_result.protocol_version {
            if version != PROTOCOL_VERSION {
                tracing::debug!(
                    backend = %self.spec.name,
                    offered = PROTOCOL_VERSION,
                    accepted = %version,
                    "backend negotiated a different protocol version"
                );
            }
        }

        self.transport
            .notify("notifications/initialized", None)
            .await
            .map_err(|e| init_failed(e.to_string()))?;

        Ok(init_result.server_info.map(|info| Implementation {
            name: info.name.unwrap_or_default(),
            version: info.version.unwrap_or_default(),
        }))
    }

    /// Fetch the backend's tool catalog, following pagination cursors.
    pub async fn discover(&mut self) -> Result<&[ToolDescriptor], McpError> {
        let discovery_failed = |reason: String| McpError::DiscoveryFailed {
            name: self.spec.name.clone(),
            reason,
        };

        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| serde_json::json!({ "cursor": c }));
            let response = self
                .transport
                .request("tools/list", params)
                .await
                .map_err(|e| discovery_failed(e.to_string()))?;
            let result = extract_result(response).map_err(|e| discovery_failed(e.to_string()))?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| discovery_failed(format!("failed to parse tools/list response: {e}")))?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        tracing::debug!(backend = %self.spec.name, count = tools.len(), "discovered tools");
        self.tools = tools;
        Ok(&self.tools)
    }

    /// Forward a `tools/call` with the backend's own tool name.
    ///
    /// Returns the backend's result verbatim; a JSON-RPC error from the backend
    /// comes back as [`McpError::ServerError`].
    pub async fn call_tool(
        &self,
        original_name: &str,
        arguments: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let mut params = serde_json::Map::new();
        params.insert("name".into(), serde_json::Value::String(original_name.to_string()));
        if let Some(arguments) = arguments {
            params.insert("arguments".into(), arguments);
        }

        let response = tokio::time::timeout(
            timeout,
            self.transport
                .request("tools/call", Some(serde_json::Value::Object(params))),
        )
        .await
        .map_err(|_| McpError::Timeout {
            tool: original_name.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        })?
        .map_err(|e| {
            // Transport errors mean the backend is gone or unusable.
            if matches!(e, McpError::TransportError { .. }) {
                McpError::ServerCrashed {
                    name: self.spec.name.clone(),
                    reason: e.to_string(),
                }
            } else {
                e
            }
        })?;

        extract_result(response)
    }

    /// Close the backend's stdin, wait briefly for exit, then force-kill.
    pub async fn shutdown(&self) {
        let _ = self.transport.close().await;

        let mut process = self.process.lock().await;
        if let Some(child) = process.as_mut() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!(backend = %self.spec.name, %status, "backend exited");
                }
                _ => {
                    tracing::debug!(backend = %self.spec.name, "backend did not exit, killing");
                    let _ = child.kill().await;
                }
            }
        }
        *process = None;

        self.set_state(BackendState::Closed);
    }

    fn with_stderr_context(&self, err: McpError) -> McpError {
        let tail = self
            .stderr_tail
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join(" | "))
            .unwrap_or_default();
        if tail.is_empty() {
            return err;
        }
        match err {
            McpError::InitFailed { name, reason } => McpError::InitFailed {
                name,
                reason: format!("{reason} | stderr: {tail}"),
            },
            other => other,
        }
    }
}

/// Forward a backend's stderr into the log, keeping the last few lines.
async fn drain_stderr(name: String, stderr: ChildStderr, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        tracing::info!(backend = %name, "{line}");
        if let Ok(mut tail) = tail.lock() {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
}

// ─── Bring-up ────────────────────────────────────────────────────────────────

/// Spawn, initialize, and discover one backend.
///
/// Handshake plus discovery share a single `timeout`; `cancel` cuts the wait
/// short. On any failure the process is torn down before returning.
pub async fn bring_up(
    spec: &BackendSpec,
    identity: &Implementation,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<BackendConnection, McpError> {
    let conn = BackendConnection::start(spec)?;
    bring_up_connection(conn, identity, timeout, cancel).await
}

/// Initialize and discover an already-started connection.
pub async fn bring_up_connection(
    mut conn: BackendConnection,
    identity: &Implementation,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<BackendConnection, McpError> {
    let deadline = Instant::now() + timeout;
    let name = conn.spec.name.clone();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => Err(McpError::Cancelled { name }),
        result = handshake_and_discover(&mut conn, identity, deadline) => result,
    };

    match outcome {
        Ok(()) => Ok(conn),
        Err(e) => {
            conn.shutdown().await;
            // Failed is terminal, even once the process is gone.
            conn.set_state(BackendState::Failed);
            Err(e)
        }
    }
}

async fn handshake_and_discover(
    conn: &mut BackendConnection,
    identity: &Implementation,
    deadline: Instant,
) -> Result<(), McpError> {
    conn.initialize_until(identity, deadline).await?;

    let name = conn.spec.name.clone();
    match timeout_at(deadline, conn.discover()).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(McpError::DiscoveryFailed {
            name,
            reason: "tool discovery timed out".into(),
        }),
    }
}

// ─── Batch Operations ────────────────────────────────────────────────────────

/// Bring up every backend concurrently, each under its own timeout.
///
/// Returns the Ready connections and the per-backend failures, both in
/// configuration order. A failure never affects the other backends.
pub async fn start_all(
    specs: &[BackendSpec],
    identity: &Implementation,
    timeout: Duration,
    cancel: &CancellationToken,
) -> (Vec<BackendConnection>, Vec<(String, McpError)>) {
    let attempts = specs
        .iter()
        .map(|spec| bring_up(spec, identity, timeout, cancel));
    let outcomes = futures::future::join_all(attempts).await;

    let mut ready = Vec::new();
    let mut errors = Vec::new();
    for (spec, outcome) in specs.iter().zip(outcomes) {
        match outcome {
            Ok(conn) => ready.push(conn),
            Err(e) => errors.push((spec.name.clone(), e)),
        }
    }

    (ready, errors)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::testing::{catalog_handler, fake_transport, tools, Handler, Reply};
    use serde_json::json;

    fn identity() -> Implementation {
        Implementation {
            name: "combine-mcp".into(),
            version: "test".into(),
        }
    }

    fn fake(name: &str, handler: Handler) -> (BackendConnection, crate::mcp_client::testing::Recorded) {
        let (transport, recorded) = fake_transport(name, handler);
        (
            BackendConnection::from_transport(&BackendSpec::new(name, "fake"), transport),
            recorded,
        )
    }

    #[tokio::test]
    async fn test_initialize_sends_identity_and_initialized_notification() {
        let (mut conn, recorded) = fake("shortcut", catalog_handler(tools(&["search-stories"])));
        assert_eq!(conn.state(), BackendState::Pending);

        conn.initialize(&identity(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(conn.state(), BackendState::Ready);
        assert_eq!(conn.server_info().unwrap().name, "fake");

        // The notification is written right after the response is read.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            recorded.methods(),
            vec!["initialize", "notifications/initialized"]
        );
    }

    #[tokio::test]
    async fn test_initialize_timeout_marks_failed() {
        let silent: Handler = Arc::new(|_: &str, _: Option<&serde_json::Value>| Reply::Silent);
        let (mut conn, _) = fake("hung", silent);

        let err = conn
            .initialize(&identity(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::InitFailed { .. }));
        assert!(err.to_string().contains("timed out"));
        assert_eq!(conn.state(), BackendState::Failed);
    }

    #[tokio::test]
    async fn test_initialize_server_error_marks_failed() {
        let refusing: Handler = Arc::new(|_: &str, _: Option<&serde_json::Value>| {
            Reply::Error(crate::mcp_client::types::JsonRpcError {
                code: -32600,
                message: "unsupported protocol".into(),
                data: None,
            })
        });
        let (mut conn, _) = fake("old", refusing);
        let err = conn
            .initialize(&identity(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported protocol"));
        assert_eq!(conn.state(), BackendState::Failed);
    }

    #[tokio::test]
    async fn test_discover_follows_cursor() {
        let paged: Handler = Arc::new(|method: &str, params: Option<&serde_json::Value>| match method {
            "initialize" => Reply::Result(json!({"serverInfo": {"name": "paged"}})),
            "tools/list" => match params.and_then(|p| p.get("cursor")) {
                None => Reply::Result(json!({"tools": [{"name": "a"}], "nextCursor": "2"})),
                Some(_) => Reply::Result(json!({"tools": [{"name": "b"}]})),
            },
            _ => Reply::Silent,
        });
        let (mut conn, _) = fake("paged", paged);
        conn.initialize(&identity(), Duration::from_secs(5)).await.unwrap();
        let names: Vec<String> = conn
            .discover()
            .await
            .unwrap()
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_call_tool_forwards_original_name_and_arguments() {
        let (mut conn, recorded) = fake("shortcut", catalog_handler(tools(&["search-stories"])));
        conn.initialize(&identity(), Duration::from_secs(5)).await.unwrap();

        let args = json!({"query": "login bug", "limit": 5});
        let result = conn
            .call_tool("search-stories", Some(args.clone()), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result["echo"]["name"], "search-stories");
        assert_eq!(result["echo"]["arguments"], args);
        assert_eq!(recorded.calls(), vec![json!({"name": "search-stories", "arguments": args})]);
    }

    #[tokio::test]
    async fn test_call_tool_without_arguments_omits_them() {
        let (conn, recorded) = fake("s", catalog_handler(tools(&["t"])));
        conn.call_tool("t", None, Duration::from_secs(5)).await.unwrap();
        assert_eq!(recorded.calls(), vec![json!({"name": "t"})]);
    }

    #[tokio::test]
    async fn test_call_tool_times_out_on_silent_backend() {
        let hangs_on_call: Handler = Arc::new(|method: &str, _: Option<&serde_json::Value>| {
            match method {
                "initialize" => Reply::Result(json!({"serverInfo": {"name": "slow"}})),
                _ => Reply::Silent,
            }
        });
        let (mut conn, _) = fake("slow", hangs_on_call);
        conn.initialize(&identity(), Duration::from_secs(5)).await.unwrap();

        let err = conn
            .call_tool("think", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            McpError::Timeout { tool, timeout_ms } => {
                assert_eq!(tool, "think");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("expected Timeout, got {other:?}"),
        }
        // A slow call leaves the backend usable.
        assert_eq!(conn.state(), BackendState::Ready);
    }

    #[tokio::test]
    async fn test_crash_after_ready_fails_calls_with_server_crashed() {
        let crashes_on_call: Handler = Arc::new(|method: &str, _: Option<&serde_json::Value>| {
            match method {
                "initialize" => Reply::Result(json!({"serverInfo": {"name": "fragile"}})),
                _ => Reply::Hangup,
            }
        });
        let (mut conn, _) = fake("fragile", crashes_on_call);
        conn.initialize(&identity(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(conn.state(), BackendState::Ready);

        let err = conn
            .call_tool("t", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerCrashed { ref name, .. } if name == "fragile"), "{err:?}");
        assert_eq!(err.rpc_code(), crate::mcp_client::types::error_codes::INTERNAL_ERROR);
        assert_eq!(conn.state(), BackendState::Closed);

        let err = conn
            .call_tool("t", None, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerCrashed { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_bring_up_cancelled() {
        let silent: Handler = Arc::new(|_: &str, _: Option<&serde_json::Value>| Reply::Silent);
        let (conn, _) = fake("slow", silent);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = bring_up_connection(conn, &identity(), Duration::from_secs(60), &cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_start_all_reports_spawn_failure_and_keeps_order() {
        let specs = vec![
            BackendSpec::new("missing-a", "/nonexistent/combine-mcp-backend-a"),
            BackendSpec::new("missing-b", "/nonexistent/combine-mcp-backend-b"),
        ];
        let (ready, errors) =
            start_all(&specs, &identity(), Duration::from_secs(5), &CancellationToken::new()).await;
        assert!(ready.is_empty());
        let names: Vec<&str> = errors.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["missing-a", "missing-b"]);
        assert!(errors
            .iter()
            .all(|(_, e)| matches!(e, McpError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_marks_closed() {
        let (mut conn, _) = fake("s", catalog_handler(tools(&["t"])));
        conn.initialize(&identity(), Duration::from_secs(5)).await.unwrap();
        conn.shutdown().await;
        assert_eq!(conn.state(), BackendState::Closed);
    }
}
