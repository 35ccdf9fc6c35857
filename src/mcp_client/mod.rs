//! MCP Client: JSON-RPC over stdio to many backend MCP servers.
//!
//! This module handles:
//! - Spawning and supervising backend child processes
//! - JSON-RPC 2.0 communication over process stdio
//! - Tool discovery and aggregation under collision-free public names
//! - Tool call routing to the owning backend
//! - Backend lifecycle (start, handshake, graceful shutdown)
//!
//! The [`Aggregator`] is used by the front-end dispatcher in `server`.

pub mod client;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use client::{Aggregator, StartupReport, SupervisorSettings};
pub use errors::McpError;
pub use lifecycle::{BackendConnection, BackendState};
pub use registry::{ToolMapping, ToolRegistry};
pub use types::{BackendSpec, ToolDescriptor};
