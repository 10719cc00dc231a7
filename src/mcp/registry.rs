//! Merged view of every tool discovered across ready backends.
//!
//! The registry is published as an immutable snapshot behind an `Arc`.
//! Rebuilds construct a complete new mapping and swap it in whole, so a
//! reader holds either the pre- or post-update view and never a partial
//! merge.

use crate::api::{ChatToolDefinition, ChatToolFunction};
use rust_mcp_schema::Tool;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

/// One tool together with the backend that owns it.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub backend: String,
    pub tool: Tool,
}

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    tools: HashMap<String, RegisteredTool>,
}

impl RegistrySnapshot {
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    pub fn tools(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.values()
    }

    /// Tool names in deterministic order for prompts and status output.
    pub fn names_sorted(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Engine-facing tool definitions, sorted by name so request payloads
    /// are stable across rebuilds.
    pub fn tool_definitions(&self) -> Vec<ChatToolDefinition> {
        let mut entries: Vec<&RegisteredTool> = self.tools.values().collect();
        entries.sort_by(|a, b| a.tool.name.cmp(&b.tool.name));
        entries
            .into_iter()
            .map(|entry| ChatToolDefinition {
                kind: "function".to_string(),
                function: ChatToolFunction {
                    name: entry.tool.name.clone(),
                    description: entry.tool.description.clone(),
                    parameters: serde_json::to_value(&entry.tool.input_schema)
                        .unwrap_or_else(|_| serde_json::json!({"type": "object"})),
                },
            })
            .collect()
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    snapshot: RwLock<Arc<RegistrySnapshot>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; cheap to clone and safe to hold across awaits.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        // Poisoning only happens if a rebuild panicked; nothing to recover.
        self.snapshot.read().expect("registry lock poisoned").clone()
    }

    /// Replaces the registry with a fresh merge of the given backends'
    /// tools. Name collisions resolve last-registered-wins and are logged.
    pub fn rebuild<'a, I>(&self, backends: I)
    where
        I: IntoIterator<Item = (&'a str, &'a [Tool])>,
    {
        let mut tools: HashMap<String, RegisteredTool> = HashMap::new();
        for (backend, backend_tools) in backends {
            for tool in backend_tools {
                if let Some(previous) = tools.insert(
                    tool.name.clone(),
                    RegisteredTool {
                        backend: backend.to_string(),
                        tool: tool.clone(),
                    },
                ) {
                    warn!(
                        tool = %tool.name,
                        kept = %backend,
                        displaced = %previous.backend,
                        "Tool name collision; last registered backend wins"
                    );
                }
            }
        }

        let next = Arc::new(RegistrySnapshot { tools });
        *self.snapshot.write().expect("registry lock poisoned") = next;
    }
}
