// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The ensemble runtime core: the multi-round agent loop over any
//! provider adapter, message history with hybrid compaction, cooperative
//! pause, result aggregation, and the embedding cache — all owned by an
//! explicit [`Runtime`] handle.

mod agent;
mod aggregate;
mod embed;
mod history;
mod orchestrator;
mod pause;
mod runtime;

pub use agent::AgentDefinition;
pub use aggregate::{ResultAggregator, RunResult};
pub use embed::{ensemble_embed, EmbeddingCache};
pub use history::{
    normalize_messages, ExtractedInfo, MessageHistory, MicroLogEntry, ToolUsage,
    SUMMARY_SENTINEL,
};
pub use orchestrator::{RequestOptions, RequestOrchestrator};
pub use pause::{PauseController, WaitAborted};
pub use runtime::Runtime;
