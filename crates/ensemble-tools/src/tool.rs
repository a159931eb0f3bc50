// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use ensemble_model::ToolSchema;

/// Execution context injected into every tool invocation.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub call_id: String,
}

/// Bound arguments: parameter name → value.
pub type ToolArgs = serde_json::Map<String, Value>;

/// The callable side of a tool.
///
/// Implementations receive arguments already bound by the execution
/// manager; they are responsible for their own validation of missing or
/// mistyped parameters.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, ctx: &ToolContext, args: ToolArgs) -> anyhow::Result<Value>;
}

type HandlerFn =
    Box<dyn Fn(ToolContext, ToolArgs) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

struct FnHandler(HandlerFn);

#[async_trait]
impl ToolHandler for FnHandler {
    async fn call(&self, ctx: &ToolContext, args: ToolArgs) -> anyhow::Result<Value> {
        (self.0)(ctx.clone(), args).await
    }
}

/// Schema of a tool, as advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// Behavioural grouping of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolCategory {
    #[default]
    General,
    /// Control tools always run through the per-agent sequential lane.
    Control,
    /// Background-tool observation (`get_running_tools` and friends).
    Status,
}

/// A registered tool: schema plus typed handler plus execution flags.
pub struct ToolFunction {
    pub definition: ToolDefinition,
    handler: Arc<dyn ToolHandler>,
    /// Long output may be replaced by a stored summary.
    pub allow_summary: bool,
    /// Prepend the calling agent's id to the bound arguments.
    pub inject_agent_id: bool,
    /// Truncate long output but never summarize it.
    pub skip_summarization: bool,
    /// Per-tool result cap override, in characters.
    pub max_length: Option<usize>,
    pub category: ToolCategory,
}

impl ToolFunction {
    pub fn new(definition: ToolDefinition, handler: Arc<dyn ToolHandler>) -> Self {
        Self {
            definition,
            handler,
            allow_summary: true,
            inject_agent_id: false,
            skip_summarization: false,
            max_length: None,
            category: ToolCategory::General,
        }
    }

    /// Build a tool from an async closure.
    pub fn from_fn<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        f: F,
    ) -> Self
    where
        F: Fn(ToolContext, ToolArgs) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = FnHandler(Box::new(move |ctx, args| Box::pin(f(ctx, args))));
        Self::new(
            ToolDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
            Arc::new(handler),
        )
    }

    pub fn with_category(mut self, category: ToolCategory) -> Self {
        self.category = category;
        self
    }

    pub fn with_inject_agent_id(mut self) -> Self {
        self.inject_agent_id = true;
        self
    }

    pub fn with_allow_summary(mut self, allow: bool) -> Self {
        self.allow_summary = allow;
        self
    }

    pub fn with_skip_summarization(mut self) -> Self {
        self.skip_summarization = true;
        self
    }

    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// The schema view sent to providers.
    pub fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            parameters: self.definition.parameters.clone(),
        }
    }

    /// Declared parameter names.  Order follows the schema's `required`
    /// array when present (JSON arrays preserve order), then the remaining
    /// properties alphabetically.
    pub fn param_names(&self) -> Vec<String> {
        let props = self.definition.parameters.get("properties");
        let mut names: Vec<String> = Vec::new();
        if let Some(required) = self
            .definition
            .parameters
            .get("required")
            .and_then(Value::as_array)
        {
            for r in required {
                if let Some(s) = r.as_str() {
                    names.push(s.to_string());
                }
            }
        }
        if let Some(props) = props.and_then(Value::as_object) {
            for key in props.keys() {
                if !names.contains(key) {
                    names.push(key.clone());
                }
            }
        }
        names
    }

    pub async fn invoke(&self, ctx: &ToolContext, args: ToolArgs) -> anyhow::Result<Value> {
        self.handler.call(ctx, args).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn add_tool() -> ToolFunction {
        ToolFunction::from_fn(
            "add",
            "adds two numbers",
            json!({
                "type": "object",
                "properties": {
                    "x": { "type": "number" },
                    "y": { "type": "number" }
                },
                "required": ["x", "y"]
            }),
            |_ctx, args| async move {
                let x = args.get("x").and_then(Value::as_f64).unwrap_or(0.0);
                let y = args.get("y").and_then(Value::as_f64).unwrap_or(0.0);
                Ok(json!(x + y))
            },
        )
    }

    #[tokio::test]
    async fn from_fn_tool_invokes() {
        let tool = add_tool();
        let mut args = ToolArgs::new();
        args.insert("x".into(), json!(2));
        args.insert("y".into(), json!(3));
        let ctx = ToolContext {
            agent_id: "a".into(),
            call_id: "c".into(),
        };
        let out = tool.invoke(&ctx, args).await.unwrap();
        assert_eq!(out, json!(5.0));
    }

    #[test]
    fn schema_mirrors_definition() {
        let tool = add_tool();
        let s = tool.schema();
        assert_eq!(s.name, "add");
        assert_eq!(s.description, "adds two numbers");
        assert!(s.parameters["properties"]["x"].is_object());
    }

    #[test]
    fn param_names_follow_required_order() {
        let tool = ToolFunction::from_fn(
            "t",
            "",
            json!({
                "type": "object",
                "properties": {
                    "alpha": {}, "zeta": {}, "beta": {}
                },
                "required": ["zeta", "alpha"]
            }),
            |_ctx, _args| async move { Ok(Value::Null) },
        );
        assert_eq!(tool.param_names(), vec!["zeta", "alpha", "beta"]);
    }

    #[test]
    fn defaults_allow_summary_no_injection() {
        let tool = add_tool();
        assert!(tool.allow_summary);
        assert!(!tool.inject_agent_id);
        assert!(!tool.skip_summarization);
        assert_eq!(tool.category, ToolCategory::General);
        assert!(tool.max_length.is_none());
    }

    #[test]
    fn builder_flags_apply() {
        let tool = add_tool()
            .with_category(ToolCategory::Control)
            .with_inject_agent_id()
            .with_allow_summary(false)
            .with_max_length(100);
        assert_eq!(tool.category, ToolCategory::Control);
        assert!(tool.inject_agent_id);
        assert!(!tool.allow_summary);
        assert_eq!(tool.max_length, Some(100));
    }
}
