// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Folds a canonical event sequence into one final result record.
//!
//! An alternate consumer for callers that do not want to stream: feed it
//! every event (or hand it the whole stream) and read the assembled
//! message, tool results, cost, and files at the end.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use futures::StreamExt;

use ensemble_model::{
    events::ToolCallResult, AgentTag, Event, EventStream, Message,
};

/// The folded outcome of one request.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub message: String,
    pub thinking: Option<String>,
    pub cost: Option<f64>,
    pub tools: Vec<ToolCallResult>,
    /// Completed file payloads, in arrival order.
    pub files: Vec<String>,
    pub error: Option<String>,
    pub response_outputs: Vec<Message>,
    pub agent: Option<AgentTag>,
    /// True when the stream terminated with `stream_end`.
    pub completed: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub message_ids: Vec<String>,
}

/// Streaming fold over canonical events.
#[derive(Default)]
pub struct ResultAggregator {
    result: RunResult,
    /// Delta accumulation per message id, used when no `message_complete`
    /// arrives for that id.
    deltas: HashMap<String, String>,
    completes: HashMap<String, String>,
    thinking: String,
    order: Vec<String>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event.
    pub fn ingest(&mut self, event: &Event) {
        let ctx = event.context();
        if self.result.start_time.is_none() {
            self.result.start_time = ctx.timestamp.or_else(|| Some(Utc::now()));
        }
        self.result.end_time = ctx.timestamp.or_else(|| Some(Utc::now()));
        if self.result.agent.is_none() {
            self.result.agent = ctx.agent.clone();
        }

        match event {
            Event::MessageStart { message_id, .. } => {
                if !self.order.contains(message_id) {
                    self.order.push(message_id.clone());
                }
            }
            Event::MessageDelta {
                message_id,
                content,
                thinking_content,
                ..
            } => {
                if !self.order.contains(message_id) {
                    self.order.push(message_id.clone());
                }
                self.deltas
                    .entry(message_id.clone())
                    .or_default()
                    .push_str(content);
                if let Some(t) = thinking_content {
                    self.thinking.push_str(t);
                }
            }
            Event::MessageComplete {
                message_id,
                content,
                thinking_content,
                ..
            } => {
                if !self.order.contains(message_id) {
                    self.order.push(message_id.clone());
                }
                self.completes.insert(message_id.clone(), content.clone());
                if let Some(t) = thinking_content {
                    if self.thinking.is_empty() {
                        self.thinking.push_str(t);
                    }
                }
            }
            Event::ToolDone { result, .. } => {
                self.result.tools.push(result.clone());
            }
            Event::FileComplete { data, .. } => {
                self.result.files.push(data.clone());
            }
            Event::CostUpdate { usage, .. } => {
                *self.result.cost.get_or_insert(0.0) += usage.cost;
            }
            Event::ResponseOutput { message, .. } => {
                self.result.response_outputs.push(message.clone());
            }
            Event::Error { error, .. } => {
                self.result.error = Some(error.clone());
            }
            Event::StreamEnd { .. } => {
                self.result.completed = true;
            }
            _ => {}
        }
    }

    /// Finish the fold: assemble message content from completes where
    /// present, concatenated deltas otherwise.
    pub fn finish(mut self) -> RunResult {
        let mut parts = Vec::new();
        for id in &self.order {
            let text = self
                .completes
                .remove(id)
                .or_else(|| self.deltas.remove(id))
                .unwrap_or_default();
            if !text.is_empty() {
                parts.push(text);
            }
        }
        self.result.message = parts.join("");
        self.result.message_ids = self.order;
        if !self.thinking.is_empty() {
            self.result.thinking = Some(self.thinking);
        }
        self.result
    }

    /// Drain a whole stream into a result record.  Stream-level errors are
    /// folded into `error`.
    pub async fn collect(mut stream: EventStream) -> RunResult {
        let mut agg = Self::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(ev) => agg.ingest(&ev),
                Err(e) => {
                    agg.result.error = Some(e.to_string());
                    break;
                }
            }
        }
        agg.finish()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
