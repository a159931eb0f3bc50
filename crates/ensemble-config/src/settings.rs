// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// How the model is allowed to use tools for a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// The model decides whether to call a tool (provider default).
    Auto,
    /// Tool calls are disabled for this request.
    None,
    /// The model must call at least one tool.
    Required,
    /// The model must call the named tool.
    Named(String),
}

/// Per-request model parameters forwarded to the provider adapter.
///
/// All fields are optional; `None` means "use the provider default".
/// `sequential_tools` is the one behavioural flag: it forces all tool
/// calls of one agent through the per-agent FIFO lane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub tool_choice: Option<ToolChoice>,
    /// JSON Schema the response must conform to (structured output).
    pub json_schema: Option<serde_json::Value>,
    /// When true, tools for this agent never run concurrently.
    pub sequential_tools: bool,
    pub verbosity: Option<String>,
    pub service_tier: Option<String>,
}

/// Retry policy for retryable provider failures (rate limits, interrupted
/// streams).  Delays grow exponentially from `initial_delay_ms` by
/// `backoff_multiplier`, capped at `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryOptions {
    /// Delay before retry attempt `attempt` (0-based), in milliseconds.
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let mult = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let delay = (self.initial_delay_ms as f64 * mult) as u64;
        delay.min(self.max_delay_ms)
    }
}

/// Hard ceilings on one agent request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentLimits {
    /// Maximum tool executions across the whole request.
    pub max_tool_calls: u32,
    /// Maximum tool-call rounds (provider stream openings minus one).
    pub max_tool_call_rounds_per_turn: u32,
    /// How many times a failing verification may re-run the main agent.
    pub max_verification_attempts: u32,
}

impl Default for AgentLimits {
    fn default() -> Self {
        Self {
            max_tool_calls: 200,
            max_tool_call_rounds_per_turn: 100,
            max_verification_attempts: 2,
        }
    }
}

/// History compaction knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Compaction fires when estimated tokens exceed this fraction of the
    /// model's context window.
    pub threshold: f32,
    /// Fraction of current tokens kept verbatim as the recent tail.
    pub keep_recent_fraction: f32,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            keep_recent_fraction: 0.3,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
