//! Catalogue of named operations the agent can invoke.
//!
//! Each tool carries a JSON input schema, a description for the runtime's
//! catalog, and a typed handler. Handlers are idempotent where possible;
//! side-effecting handlers run inside the hook pipeline, which takes
//! checkpoints for them.

pub mod evidence;
pub mod feature_ops;
pub mod file_ops;
pub mod queries;
pub mod server;
pub mod shell;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::config::ProjectPaths;
use crate::runtime::{ToolOutput, ToolSpec};
use crate::store::Db;
use server::ProcessTracker;

/// Shared state handed to every tool handler.
#[derive(Clone)]
pub struct ToolContext {
    pub db: Db,
    pub paths: ProjectPaths,
    pub session_id: i64,
    pub processes: ProcessTracker,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;
    async fn handle(&self, ctx: &ToolContext, input: Value) -> Result<ToolOutput>;
}

pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with the full built-in tool set.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        for tool in file_ops::tools() {
            registry.register(tool);
        }
        registry.register(Arc::new(shell::BashTool));
        for tool in feature_ops::tools() {
            registry.register(tool);
        }
        registry.register(Arc::new(evidence::ScreenshotCaptureTool));
        for tool in queries::tools() {
            registry.register(tool);
        }
        for tool in server::tools() {
            registry.register(tool);
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Catalog advertised to the LLM runtime, sorted by name for a
    /// stable prompt.
    pub fn catalog(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtin_tools()
    }
}

/// Pull a required string field out of a tool input.
pub(crate) fn require_str<'a>(input: &'a Value, field: &str) -> Result<&'a str> {
    input
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("missing required field '{field}'"))
}

/// Pull a required integer field out of a tool input.
pub(crate) fn require_i64(input: &Value, field: &str) -> Result<i64> {
    input
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow::anyhow!("missing required field '{field}'"))
}

#[cfg(test)]
pub(crate) fn test_context() -> (ToolContext, tempfile::TempDir) {
    use crate::store::StateStore;
    let dir = tempfile::tempdir().unwrap();
    let paths = ProjectPaths::new(dir.path());
    paths.ensure_dirs().unwrap();
    let mut store = StateStore::open(&paths).unwrap();
    let session = store.create_session().unwrap();
    let context = ToolContext {
        db: Db::new(store),
        paths,
        session_id: session.id,
        processes: ProcessTracker::new(),
    };
    (context, dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_covers_every_family() {
        let registry = ToolRegistry::with_builtin_tools();
        for name in [
            "read_file",
            "write_file",
            "edit_file",
            "glob",
            "grep",
            "bash",
            "screenshot_capture",
            "feature_next",
            "feature_show",
            "feature_mark",
            "feature_list",
            "feature_search",
            "feature_add_dependency",
            "feature_unblock",
            "memory_search",
            "progress_status",
            "decision_record",
            "decision_query",
            "hypothesis_record",
            "hypothesis_query",
            "intervention_query",
            "server_start",
            "server_stop",
            "server_wait",
            "server_status",
        ] {
            assert!(registry.contains(name), "missing tool {name}");
        }
    }

    #[test]
    fn catalog_is_sorted_and_schema_shaped() {
        let registry = ToolRegistry::with_builtin_tools();
        let catalog = registry.catalog();
        let names: Vec<&str> = catalog.iter().map(|s| s.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        for spec in &catalog {
            assert_eq!(spec.input_schema["type"], "object", "{}", spec.name);
        }
    }
}
