// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-independent model layer.
//!
//! Message data model, the canonical event taxonomy, the `ProviderAdapter`
//! interface, the model catalog with pricing, weighted model selection,
//! quota tracking, and the central usage/cost ledger.  The one bundled wire
//! implementation is the generic OpenAI-compatible SSE adapter in [`http`];
//! everything else plugs in through [`provider::ProviderAdapter`].

pub mod catalog;
pub mod cost;
pub mod error;
pub mod events;
pub mod http;
pub mod mock;
pub mod provider;
pub mod quota;
pub mod registry;
pub mod selector;
pub mod types;

pub use catalog::{ModelClass, ModelEntry};
pub use cost::{CostTracker, UsagePartial, UsageRecord};
pub use error::{ProviderError, QuotaKind};
pub use events::{AgentTag, Event, EventContext, FunctionSpec, ToolCall, ToolCallResult};
pub use provider::{
    EmbedOptions, EventStream, ProviderAdapter, StreamOptions, Summarizer, ToolSchema,
};
pub use quota::{QuotaLimits, QuotaTracker};
pub use selector::{ModelSelector, SelectionRequest};
pub use types::{
    ChatRole, ContentPart, Message, MessageContent, MessageMeta, MessageStatus, ThinkingBlock,
};
