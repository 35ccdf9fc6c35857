//! Tool registry: maps public tool names to `(backend, original name)`.
//!
//! Provides:
//! - Name sanitization and public-name derivation (`backend_tool`)
//! - Registration with an optional per-backend allow-list
//! - The public catalog served to the front-end (renamed, described, normalized)
//! - Resolution of a public name back to its owning backend
//!
//! Public names are unique. Registering a tool whose derived name is already
//! taken replaces the earlier mapping (last write wins).

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;

use super::errors::McpError;
use super::types::ToolDescriptor;

// ─── Naming ──────────────────────────────────────────────────────────────────

/// Replace every `-` with `_`.
pub fn sanitize(name: &str) -> String {
    name.replace('-', "_")
}

/// Public name of `original` as exposed by `backend`.
///
/// E.g., `("shortcut", "search-stories")` → `"shortcut_search_stories"`.
pub fn public_name(backend: &str, original: &str) -> String {
    format!("{}_{}", sanitize(backend), sanitize(original))
}

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Where a public tool name routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolMapping {
    pub public_name: String,
    pub backend: String,
    pub original_name: String,
}

#[derive(Debug, Clone)]
struct RegisteredTool {
    mapping: ToolMapping,
    /// Descriptor as discovered, reused for every catalog request.
    descriptor: ToolDescriptor,
}

/// Aggregated tool registry across all backends, keyed by public name.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend's tools, filtered by `allowed` when present.
    ///
    /// `Some(&[])` registers nothing. Names in `allowed` that the backend does
    /// not expose are ignored. Returns the number of tools registered.
    pub fn register(
        &mut self,
        backend: &str,
        descriptors: &[ToolDescriptor],
        allowed: Option<&[String]>,
    ) -> usize {
        let allow_set: Option<HashSet<&str>> =
            allowed.map(|names| names.iter().map(String::as_str).collect());

        if let Some(set) = &allow_set {
            let unknown: Vec<&str> = set
                .iter()
                .copied()
                .filter(|name| !descriptors.iter().any(|d| d.name == *name))
                .collect();
            if !unknown.is_empty() {
                tracing::debug!(backend, ?unknown, "allow-list names not exposed by backend");
            }
        }

        let mut registered = 0;
        for descriptor in descriptors {
            if let Some(set) = &allow_set {
                if !set.contains(descriptor.name.as_str()) {
                    continue;
                }
            }

            let public = public_name(backend, &descriptor.name);
            let mapping = ToolMapping {
                public_name: public.clone(),
                backend: backend.to_string(),
                original_name: descriptor.name.clone(),
            };

            if let Some(previous) = self.tools.get(&public) {
                tracing::warn!(
                    public_name = %public,
                    replaced_backend = %previous.mapping.backend,
                    replaced_tool = %previous.mapping.original_name,
                    backend,
                    tool = %descriptor.name,
                    "public tool name collision, keeping latest registration"
                );
            } else {
                tracing::debug!(
                    backend,
                    tool = %descriptor.name,
                    public_name = %public,
                    "registered tool"
                );
            }

            self.tools.insert(
                public,
                RegisteredTool {
                    mapping,
                    descriptor: descriptor.clone(),
                },
            );
            registered += 1;
        }

        registered
    }

    /// Remove all tools belonging to a backend.
    pub fn unregister_backend(&mut self, backend: &str) {
        self.tools.retain(|_, t| t.mapping.backend != backend);
    }

    /// Route a public name to its backend and original tool name.
    pub fn resolve(&self, public: &str) -> Result<&ToolMapping, McpError> {
        self.tools
            .get(public)
            .map(|t| &t.mapping)
            .ok_or_else(|| McpError::UnknownTool {
                name: public.to_string(),
            })
    }

    /// The public catalog, sorted by public name.
    pub fn get_all(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| {
                let mut tool = t.descriptor.clone();
                tool.name = t.mapping.public_name.clone();
                if !tool.description.is_empty() {
                    tool.description = format!("[{}] {}", t.mapping.backend, tool.description);
                }
                tool.input_schema = normalize_schema(tool.input_schema);
                tool
            })
            .collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Make a schema acceptable to strict clients: an object with `type` and a
/// non-null `properties` map. Other keywords pass through.
fn normalize_schema(schema: Value) -> Value {
    let mut obj = match schema {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    if !obj.get("type").is_some_and(|t| t.is_string()) {
        obj.insert("type".into(), Value::String("object".into()));
    }
    if obj.get("properties").map_or(true, Value::is_null) {
        obj.insert("properties".into(), Value::Object(serde_json::Map::new()));
    }

    Value::Object(obj)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
