// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool execution: argument binding, timeout policy, background promotion,
//! sequential discipline, lifecycle hooks, and result shaping.
//!
//! Every dispatch registers in the [`RunningToolTracker`] for its lifetime.
//! A tool that exceeds the wall-clock budget keeps executing on its spawned
//! task; when the agent carries a status-tracking tool the caller receives a
//! pointer string instead of an error and can pick the result up later.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::time::Duration;
use tracing::warn;
use uuid::Uuid;

use ensemble_config::{
    EXCLUDED_FROM_TIMEOUT_FUNCTIONS, FUNCTION_TIMEOUT_MS, MAX_RESULT_LENGTH,
    SKIP_SUMMARIZATION_TOOLS,
};
use ensemble_model::{Event, Summarizer, ToolCall, ToolCallResult};

use crate::{
    queue::{QueueError, SequentialQueue},
    registry::ToolRegistry,
    running::RunningToolTracker,
    summary::SummaryStore,
    tool::{ToolArgs, ToolCategory, ToolContext, ToolFunction},
};

/// Verdict from the pre-execution hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    Proceed,
    Skip,
}

/// Per-agent lifecycle hooks around tool execution.
///
/// Hook failures are logged and treated as the default verdict; they never
/// abort the call.
#[async_trait]
pub trait ToolLifecycleHooks: Send + Sync {
    /// Fires before execution.  Returning [`HookDecision::Skip`] answers the
    /// call with `"Tool skipped by policy"` without invoking the function.
    async fn on_tool_call(&self, _call: &ToolCall) -> anyhow::Result<HookDecision> {
        Ok(HookDecision::Proceed)
    }

    /// Fires after a successful execution with the shaped output.
    async fn on_tool_result(&self, _call: &ToolCall, _output: &str) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fires on failure.  May return a substitute result string; otherwise
    /// the error message becomes the output.
    async fn on_tool_error(
        &self,
        _call: &ToolCall,
        _error: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    /// Observes every canonical event of the request, after agent tagging
    /// and immediately before delivery to the caller.
    async fn on_event(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-request execution context.
#[derive(Clone)]
pub struct ExecutionContext {
    pub agent_id: String,
    /// From `ModelSettings::sequential_tools`; control tools are sequential
    /// regardless.
    pub sequential: bool,
    pub hooks: Option<Arc<dyn ToolLifecycleHooks>>,
}

impl ExecutionContext {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            sequential: false,
            hooks: None,
        }
    }
}

/// Translates a [`ToolCall`] into an invocation of a registered
/// [`ToolFunction`].
pub struct ToolExecutionManager {
    registry: Arc<ToolRegistry>,
    running: Arc<RunningToolTracker>,
    queue: Arc<SequentialQueue>,
    summarizer: Option<Arc<dyn Summarizer>>,
    summaries: Option<Arc<SummaryStore>>,
    timeout_ms: u64,
}

impl ToolExecutionManager {
    pub fn new(
        registry: Arc<ToolRegistry>,
        running: Arc<RunningToolTracker>,
        queue: Arc<SequentialQueue>,
    ) -> Self {
        Self {
            registry,
            running,
            queue,
            summarizer: None,
            summaries: None,
            timeout_ms: FUNCTION_TIMEOUT_MS,
        }
    }

    /// Enable summary-store handoff for long results.
    pub fn with_summarizer(
        mut self,
        summarizer: Arc<dyn Summarizer>,
        store: Arc<SummaryStore>,
    ) -> Self {
        self.summarizer = Some(summarizer);
        self.summaries = Some(store);
        self
    }

    /// Override the tool budget (tests).
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Execute one tool call to completion (or promotion) and shape the
    /// outcome into a [`ToolCallResult`].
    pub async fn execute(&self, call: &ToolCall, ctx: &ExecutionContext) -> ToolCallResult {
        let name = call.function.name.clone();
        let Some(tool) = self.registry.get(&name) else {
            return ToolCallResult {
                call_id: call.call_id.clone(),
                output: None,
                error: Some(format!("Unknown tool: {name}")),
            };
        };

        if let Some(hooks) = &ctx.hooks {
            match hooks.on_tool_call(call).await {
                Ok(HookDecision::Skip) => {
                    return ToolCallResult {
                        call_id: call.call_id.clone(),
                        output: Some("Tool skipped by policy".into()),
                        error: None,
                    }
                }
                Ok(HookDecision::Proceed) => {}
                Err(e) => warn!(tool = %name, error = %e, "on_tool_call hook failed; proceeding"),
            }
        }

        let outcome = match bind_arguments(&tool, call, &ctx.agent_id) {
            Ok(args) => {
                let sequential = ctx.sequential || tool.category == ToolCategory::Control;
                if sequential {
                    match self
                        .queue
                        .run_sequential(&ctx.agent_id, self.run_tracked(&tool, call, args, ctx))
                        .await
                    {
                        Ok(outcome) => outcome,
                        Err(QueueError::Cleared) => Err("cancelled".to_string()),
                    }
                } else {
                    self.run_tracked(&tool, call, args, ctx).await
                }
            }
            Err(msg) => Err(msg),
        };

        match outcome {
            Ok(raw) => {
                let output = self.render_output(&tool, &name, raw).await;
                if let Some(hooks) = &ctx.hooks {
                    if let Err(e) = hooks.on_tool_result(call, &output).await {
                        warn!(tool = %name, error = %e, "on_tool_result hook failed");
                    }
                }
                ToolCallResult {
                    call_id: call.call_id.clone(),
                    output: Some(output),
                    error: None,
                }
            }
            Err(error) => {
                let substitute = match &ctx.hooks {
                    Some(hooks) => match hooks.on_tool_error(call, &error).await {
                        Ok(sub) => sub,
                        Err(e) => {
                            warn!(tool = %name, error = %e, "on_tool_error hook failed");
                            None
                        }
                    },
                    None => None,
                };
                match substitute {
                    Some(output) => ToolCallResult {
                        call_id: call.call_id.clone(),
                        output: Some(output),
                        error: None,
                    },
                    None => ToolCallResult {
                        call_id: call.call_id.clone(),
                        output: None,
                        error: Some(error),
                    },
                }
            }
        }
    }

    /// Run the bound invocation on its own task, tracked by the running-tool
    /// registry, under the timeout policy.
    async fn run_tracked(
        &self,
        tool: &Arc<ToolFunction>,
        call: &ToolCall,
        args: ToolArgs,
        ctx: &ExecutionContext,
    ) -> Result<String, String> {
        let name = call.function.name.clone();
        let run_id = Uuid::new_v4().to_string();
        let token = self.running.add_running_tool(
            &run_id,
            &name,
            &ctx.agent_id,
            Value::Object(args.clone()),
        );
        let tctx = ToolContext {
            agent_id: ctx.agent_id.clone(),
            call_id: call.call_id.clone(),
        };

        let handle = {
            let tool = Arc::clone(tool);
            let running = Arc::clone(&self.running);
            let run_id = run_id.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => Err("aborted".to_string()),
                    res = tool.invoke(&tctx, args) => match res {
                        Ok(v) => Ok(shape_value(v)),
                        Err(e) => Err(format_error(&e)),
                    },
                };
                match &result {
                    Ok(out) => running.complete_running_tool(&run_id, out.clone()),
                    Err(e) if e == "aborted" => {} // abort() already recorded it
                    Err(e) => running.fail_running_tool(&run_id, e.clone()),
                }
                result
            })
        };

        if EXCLUDED_FROM_TIMEOUT_FUNCTIONS.contains(&name.as_str()) {
            return match handle.await {
                Ok(result) => result,
                Err(e) => Err(format!("Tool panicked: {e}")),
            };
        }

        match tokio::time::timeout(Duration::from_millis(self.timeout_ms), handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(format!("Tool panicked: {e}")),
            Err(_) => {
                // Budget expired; the spawned task keeps running and will
                // report its terminal state to the tracker.
                self.running.mark_timed_out(&run_id);
                if self.registry.has_status_tools() {
                    Ok(format!(
                        "Tool {name} is running in the background (RunningTool: {run_id})."
                    ))
                } else {
                    Err(format!(
                        "Tool {name} timed out after {}ms",
                        self.timeout_ms
                    ))
                }
            }
        }
    }

    /// Apply truncation and, when configured and allowed, summary-store
    /// handoff for long output.
    async fn render_output(&self, tool: &ToolFunction, name: &str, raw: String) -> String {
        let cap = tool.max_length.unwrap_or(MAX_RESULT_LENGTH);
        if raw.len() <= cap {
            return raw;
        }
        let summarizable = tool.allow_summary
            && !tool.skip_summarization
            && !SKIP_SUMMARIZATION_TOOLS.contains(&name);
        if summarizable {
            if let (Some(summarizer), Some(store)) = (&self.summarizer, &self.summaries) {
                match summarizer
                    .summarize(&raw, &format!("output of tool {name}"))
                    .await
                {
                    Ok(summary) => match store.store(&raw, &summary) {
                        Ok(id) => {
                            return format!(
                                "{summary}\n\n[Output summarized; full text available via \
                                 read_source(\"{id}\")]"
                            )
                        }
                        Err(e) => warn!(tool = name, error = %e, "summary store write failed"),
                    },
                    Err(e) => warn!(tool = name, error = %e, "summarizer failed; truncating"),
                }
            }
        }
        truncate_result(&raw, cap)
    }
}

/// Parse the JSON argument payload and bind it to the tool's parameters.
///
/// Accepted shapes: an object (bound by name, unknown keys dropped with a
/// warning) or an array (bound whole to the first declared parameter).  A
/// missing parameter is simply absent; the tool validates its own inputs.
pub fn bind_arguments(
    tool: &ToolFunction,
    call: &ToolCall,
    agent_id: &str,
) -> Result<ToolArgs, String> {
    let raw = call.function.arguments.trim();
    let parsed: Value = if raw.is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(raw)
            .map_err(|e| format!("Invalid tool arguments JSON: {e}"))?
    };

    let declared = tool.param_names();
    let mut args = match parsed {
        Value::Object(map) => {
            if declared.is_empty() {
                // Free-form schema: pass everything through.
                map
            } else {
                let mut out = Map::new();
                for (k, v) in map {
                    if declared.contains(&k) {
                        out.insert(k, v);
                    } else {
                        warn!(tool = %tool.name(), key = %k, "dropping unknown tool argument");
                    }
                }
                out
            }
        }
        Value::Array(arr) => {
            let first = declared
                .first()
                .ok_or_else(|| "tool declares no parameters; cannot bind array".to_string())?;
            let mut out = Map::new();
            out.insert(first.clone(), Value::Array(arr));
            out
        }
        other => {
            return Err(format!(
                "Invalid tool arguments: expected object or array, got {other}"
            ))
        }
    };

    if tool.inject_agent_id {
        args.insert("agent_id".to_string(), json!(agent_id));
    }
    Ok(args)
}

/// Shape a tool's return value into the output string.
pub fn shape_value(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => serde_json::to_string_pretty(&other).unwrap_or_else(|e| {
            warn!(error = %e, "tool result not serializable; using display form");
            other.to_string()
        }),
    }
}

/// Format a tool failure as `"<ErrorName>: <message>"`.
pub fn format_error(e: &anyhow::Error) -> String {
    let name = if e.downcast_ref::<std::io::Error>().is_some() {
        "IoError"
    } else if e.downcast_ref::<serde_json::Error>().is_some() {
        "JsonError"
    } else {
        "Error"
    };
    format!("{name}: {e}")
}

/// Hard-truncate at the nearest line boundary under `cap` characters, with
/// an explicit omission notice.
pub fn truncate_result(content: &str, cap: usize) -> String {
    if content.len() <= cap {
        return content.to_string();
    }
    let omitted = content.len() - cap;
    let mut cut = cap.min(content.len());
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let cut = content[..cut].rfind('\n').map(|p| p + 1).unwrap_or(cut);
    format!(
        "{}\n[... {omitted} bytes omitted; content truncated to fit result budget ...]",
        &content[..cut]
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
