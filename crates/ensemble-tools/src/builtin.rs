// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Built-in tools: background tool observation and summary-store access.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    running::RunningToolTracker,
    summary::SummaryStore,
    tool::{ToolCategory, ToolFunction},
};

/// The status-tracking tool set over one running-tool tracker.
///
/// Registering any of these enables background promotion for the agent's
/// timed-out tools.
pub fn status_tools(running: Arc<RunningToolTracker>) -> Vec<ToolFunction> {
    let list_tracker = Arc::clone(&running);
    let get_running_tools = ToolFunction::from_fn(
        "get_running_tools",
        "List all tracked tool executions for this agent, including ones \
         promoted to the background.",
        json!({
            "type": "object",
            "properties": {
                "agent_id": { "type": "string", "description": "Filter by agent id" }
            }
        }),
        move |ctx, args| {
            let tracker = Arc::clone(&list_tracker);
            async move {
                let filter = args
                    .get("agent_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(ctx.agent_id);
                let tools = tracker.list(Some(&filter));
                Ok(serde_json::to_value(tools)?)
            }
        },
    )
    .with_category(ToolCategory::Status)
    .with_inject_agent_id();

    let wait_tracker = Arc::clone(&running);
    let wait_for_running_tool = ToolFunction::from_fn(
        "wait_for_running_tool",
        "Suspend until a background tool reaches a terminal state and \
         return its result.",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "RunningTool id" }
            },
            "required": ["id"]
        }),
        move |_ctx, args| {
            let tracker = Arc::clone(&wait_tracker);
            async move {
                let id = args
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("missing required parameter: id"))?;
                let info = tracker
                    .wait_for(id, &CancellationToken::new())
                    .await
                    .map_err(|e| anyhow!("{e}: {id}"))?;
                Ok(serde_json::to_value(info)?)
            }
        },
    )
    .with_category(ToolCategory::Status);

    let status_tracker = running;
    let get_tool_status = ToolFunction::from_fn(
        "get_tool_status",
        "Return the current status of one tracked tool execution.",
        json!({
            "type": "object",
            "properties": {
                "id": { "type": "string", "description": "RunningTool id" }
            },
            "required": ["id"]
        }),
        move |_ctx, args| {
            let tracker = Arc::clone(&status_tracker);
            async move {
                let id = args
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("missing required parameter: id"))?;
                let info = tracker
                    .get_running_tool(id)
                    .ok_or_else(|| anyhow!("no running tool with id {id}"))?;
                Ok(serde_json::to_value(info)?)
            }
        },
    )
    .with_category(ToolCategory::Status);

    vec![get_running_tools, wait_for_running_tool, get_tool_status]
}

/// Tools exposing the originals behind stored summaries.
pub fn source_tools(store: Arc<SummaryStore>) -> Vec<ToolFunction> {
    let read_store = Arc::clone(&store);
    let read_source = ToolFunction::from_fn(
        "read_source",
        "Read the original document behind a summary id, optionally sliced \
         to a 1-based line range.",
        json!({
            "type": "object",
            "properties": {
                "summary_id": { "type": "string" },
                "line_start": { "type": "integer" },
                "line_end": { "type": "integer" }
            },
            "required": ["summary_id"]
        }),
        move |_ctx, args| {
            let store = Arc::clone(&read_store);
            async move {
                let id = args
                    .get("summary_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("missing required parameter: summary_id"))?;
                let start = args.get("line_start").and_then(Value::as_u64);
                let end = args.get("line_end").and_then(Value::as_u64);
                let text = store.read_source(
                    id,
                    start.map(|v| v as usize),
                    end.map(|v| v as usize),
                )?;
                Ok(json!(text))
            }
        },
    )
    .with_skip_summarization();

    let write_store = store;
    let write_source = ToolFunction::from_fn(
        "write_source",
        "Copy the original document behind a summary id out to a file.",
        json!({
            "type": "object",
            "properties": {
                "summary_id": { "type": "string" },
                "file_path": { "type": "string" }
            },
            "required": ["summary_id", "file_path"]
        }),
        move |_ctx, args| {
            let store = Arc::clone(&write_store);
            async move {
                let id = args
                    .get("summary_id")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("missing required parameter: summary_id"))?;
                let path = args
                    .get("file_path")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("missing required parameter: file_path"))?;
                store
                    .write_source(id, path)
                    .with_context(|| format!("writing source {id}"))?;
                Ok(json!(format!("Wrote source {id} to {path}")))
            }
        },
    );

    vec![read_source, write_source]
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
