//! Aggregator: the single owner of backend connections and the tool registry.
//!
//! Orchestrates backend startup, tool registration, and tool call dispatch.
//! Constructed once by the entry point and shared (`Arc`) with the request
//! dispatcher; there is no process-wide state besides this value.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;
use super::lifecycle::{self, BackendConnection, BackendState, DEFAULT_INIT_TIMEOUT};
use super::registry::ToolRegistry;
use super::types::{BackendSpec, Implementation, ToolDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for tool call execution.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Name this aggregator announces to backends and to the front-end.
pub const AGGREGATOR_NAME: &str = "combine-mcp";

/// Fixed identity sent in every backend handshake.
pub fn aggregator_identity() -> Implementation {
    Implementation {
        name: AGGREGATOR_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

/// Timeouts applied by the supervisor.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub init_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            init_timeout: DEFAULT_INIT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// Outcome of [`Aggregator::start_all`] when at least one backend is usable.
#[derive(Debug, Default)]
pub struct StartupReport {
    /// Backends admitted to the registry, in configuration order.
    pub ready: Vec<String>,
    /// Backends excluded at startup, with the reason.
    pub failed: Vec<(String, McpError)>,
    pub tool_count: usize,
}

/// Routes front-end tool traffic across many backends.
pub struct Aggregator {
    identity: Implementation,
    settings: SupervisorSettings,
    /// Ready backends by name. Only startup and shutdown write here.
    connections: RwLock<HashMap<String, Arc<BackendConnection>>>,
    /// Public tool name → `(backend, original name)`.
    registry: RwLock<ToolRegistry>,
}

impl Aggregator {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            identity: aggregator_identity(),
            settings,
            connections: RwLock::new(HashMap::new()),
            registry: RwLock::new(ToolRegistry::new()),
        }
    }

    pub fn identity(&self) -> &Implementation {
        &self.identity
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Start every configured backend and build the registry.
    ///
    /// Individual failures are logged and the backend is left out. Fails with
    /// [`McpError::AllBackendsFailed`] only when no backend could be admitted.
    pub async fn start_all(
        &self,
        specs: &[BackendSpec],
        cancel: &CancellationToken,
    ) -> Result<StartupReport, McpError> {
        let started = Instant::now();
        let (ready, failed) =
            lifecycle::start_all(specs, &self.identity, self.settings.init_timeout, cancel).await;

        for (name, err) in &failed {
            tracing::warn!(backend = %name, error = %err, "backend excluded (non-fatal)");
        }

        let mut report = StartupReport {
            failed,
            ..StartupReport::default()
        };
        // Registration follows configuration order, so collisions resolve the
        // same way on every start.
        for conn in ready {
            report.ready.push(conn.name().to_string());
            report.tool_count += self.admit(conn).await;
        }

        tracing::info!(
            ready = report.ready.len(),
            failed = report.failed.len(),
            tools = self.tool_count().await,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backend startup finished"
        );

        if report.ready.is_empty() {
            return Err(McpError::AllBackendsFailed {
                attempted: specs.len(),
            });
        }
        Ok(report)
    }

    /// Take ownership of a Ready connection and register its tools.
    ///
    /// A connection already admitted under the same name is replaced: its
    /// mappings are dropped and its process is shut down. Returns the number
    /// of tools registered after allow-list filtering.
    pub async fn admit(&self, conn: BackendConnection) -> usize {
        let name = conn.name().to_string();
        let count = {
            let mut registry = self.registry.write().await;
            registry.unregister_backend(&name);
            registry.register(&name, conn.tools(), conn.spec().allowed_tools.as_deref())
        };
        tracing::info!(
            backend = %name,
            server = conn.server_info().map(|i| i.name.as_str()).unwrap_or("?"),
            discovered = conn.tools().len(),
            registered = count,
            "backend admitted"
        );

        let previous = self
            .connections
            .write()
            .await
            .insert(name, Arc::new(conn));
        if let Some(previous) = previous {
            tracing::info!(backend = %previous.name(), "replacing previously admitted backend");
            previous.shutdown().await;
        }
        count
    }

    /// Shut down all backends and clear the registry.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<BackendConnection>> = {
            let mut map = self.connections.write().await;
            map.drain().map(|(_, conn)| conn).collect()
        };
        *self.registry.write().await = ToolRegistry::new();

        futures::future::join_all(connections.iter().map(|conn| conn.shutdown())).await;
        tracing::info!(count = connections.len(), "all backends shut down");
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Public tool catalog across all backends.
    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.registry.read().await.get_all()
    }

    /// Execute a tool call, routing to the owning backend.
    ///
    /// Steps:
    /// 1. Resolve the public name (unknown names never reach a backend)
    /// 2. Find the owning connection
    /// 3. Forward `tools/call` with the original name and untouched arguments
    ///
    /// No lock is held while the backend works.
    pub async fn call_tool(
        &self,
        public_name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let mapping = self.registry.read().await.resolve(public_name)?.clone();

        let conn = self
            .connections
            .read()
            .await
            .get(&mapping.backend)
            .cloned()
            .ok_or(McpError::ServerCrashed {
                name: mapping.backend.clone(),
                reason: "backend not running".into(),
            })?;
        if conn.state() != BackendState::Ready {
            return Err(McpError::ServerCrashed {
                name: mapping.backend,
                reason: "backend connection closed".into(),
            });
        }

        tracing::debug!(
            public_name,
            backend = %mapping.backend,
            tool = %mapping.original_name,
            "routing tool call"
        );

        let started = Instant::now();
        let result = conn
            .call_tool(&mapping.original_name, arguments, self.settings.call_timeout)
            .await;
        tracing::debug!(
            public_name,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "tool call finished"
        );
        result
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Get the number of registered tools.
    pub async fn tool_count(&self) -> usize {
        self.registry.read().await.len()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
