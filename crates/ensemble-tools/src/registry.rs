// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use ensemble_config::STATUS_TRACKING_TOOLS;
use ensemble_model::ToolSchema;

use crate::tool::{ToolCategory, ToolFunction};

/// Central registry holding all tools available to one agent.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolFunction>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: ToolFunction) {
        self.tools
            .insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn register_all(&mut self, tools: impl IntoIterator<Item = ToolFunction>) {
        for t in tools {
            self.register(t);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolFunction>> {
        self.tools.get(name).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Schemas for all registered tools, sorted by name for a stable wire
    /// order.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| t.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn category(&self, name: &str) -> ToolCategory {
        self.tools
            .get(name)
            .map(|t| t.category)
            .unwrap_or_default()
    }

    /// Whether this agent can observe background tools.  Governs timeout
    /// promotion: without a status-tracking tool a timed-out tool is simply
    /// reported as failed.
    pub fn has_status_tools(&self) -> bool {
        STATUS_TRACKING_TOOLS
            .iter()
            .any(|name| self.tools.contains_key(*name))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn echo_tool(name: &str) -> ToolFunction {
        ToolFunction::from_fn(name, "echoes", json!({"type": "object"}), |_ctx, args| {
            async move { Ok(Value::Object(args)) }
        })
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("echo"));
        assert!(reg.get("echo").is_some());
        assert!(reg.get("nope").is_none());
    }

    #[test]
    fn schemas_are_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("zeta"));
        reg.register(echo_tool("alpha"));
        let schemas = reg.schemas();
        assert_eq!(schemas[0].name, "alpha");
        assert_eq!(schemas[1].name, "zeta");
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("t"));
        reg.register(echo_tool("t"));
        assert_eq!(reg.names().len(), 1);
    }

    #[test]
    fn has_status_tools_detects_tracking_tool() {
        let mut reg = ToolRegistry::new();
        assert!(!reg.has_status_tools());
        reg.register(echo_tool("get_running_tools"));
        assert!(reg.has_status_tools());
    }

    #[test]
    fn category_defaults_to_general_for_unknown() {
        let reg = ToolRegistry::new();
        assert_eq!(reg.category("nope"), ToolCategory::General);
    }
}
