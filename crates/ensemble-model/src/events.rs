// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The provider-independent event taxonomy.
//!
//! Every adapter translates its wire format into this enum; the orchestrator
//! forwards events downstream after tagging them with agent context.  The
//! serde representation is the wire shape callers observe: a `type` tag plus
//! the payload fields, with `timestamp` / `request_id` / `agent` flattened in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cost::UsageRecord;
use crate::types::Message;

/// Identity of the agent an event belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentTag {
    pub agent_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

/// Context fields shared by every event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<AgentTag>,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub call_id: String,
    pub function: FunctionSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionSpec {
    pub name: String,
    /// JSON-encoded argument object; parsed exactly once at execution.
    pub arguments: String,
}

/// Outcome of one tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolCallResult {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How file payload bytes are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataFormat {
    Base64,
    Url,
}

/// PCM stream parameters accompanying raw audio chunks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PcmParameters {
    pub sample_rate: u32,
    pub channels: u8,
    pub bits_per_sample: u8,
}

/// Agent lifecycle state carried by `agent_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    WaitingOnTools,
    Verifying,
    Done,
}

/// The canonical streamed event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    MessageStart {
        message_id: String,
        role: String,
        #[serde(flatten)]
        ctx: EventContext,
    },
    MessageDelta {
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_signature: Option<String>,
        #[serde(flatten)]
        ctx: EventContext,
    },
    MessageComplete {
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_signature: Option<String>,
        #[serde(flatten)]
        ctx: EventContext,
    },
    ToolStart {
        tool_call: ToolCall,
        #[serde(flatten)]
        ctx: EventContext,
    },
    ToolDelta {
        tool_call_id: String,
        arguments_delta: String,
        #[serde(flatten)]
        ctx: EventContext,
    },
    ToolDone {
        tool_call: ToolCall,
        result: ToolCallResult,
        #[serde(flatten)]
        ctx: EventContext,
    },
    FileStart {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        data_format: DataFormat,
        #[serde(flatten)]
        ctx: EventContext,
    },
    FileDelta {
        message_id: String,
        data: String,
        #[serde(flatten)]
        ctx: EventContext,
    },
    FileComplete {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
        data: String,
        data_format: DataFormat,
        #[serde(flatten)]
        ctx: EventContext,
    },
    AudioStream {
        chunk_index: u32,
        is_final_chunk: bool,
        /// Base64-encoded audio bytes.
        data: String,
        format: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pcm_parameters: Option<PcmParameters>,
        #[serde(flatten)]
        ctx: EventContext,
    },
    CostUpdate {
        usage: UsageRecord,
        #[serde(flatten)]
        ctx: EventContext,
    },
    ResponseOutput {
        message: Message,
        #[serde(flatten)]
        ctx: EventContext,
    },
    AgentStart {
        agent: AgentTag,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<String>,
        #[serde(flatten)]
        ctx: EventContext,
    },
    AgentStatus {
        agent: AgentTag,
        status: AgentStatus,
        #[serde(flatten)]
        ctx: EventContext,
    },
    AgentDone {
        agent: AgentTag,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(flatten)]
        ctx: EventContext,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(flatten)]
        ctx: EventContext,
    },
    StreamEnd {
        #[serde(flatten)]
        ctx: EventContext,
    },
}

impl Event {
    /// The shared context fields of any variant.
    pub fn context(&self) -> &EventContext {
        match self {
            Event::MessageStart { ctx, .. }
            | Event::MessageDelta { ctx, .. }
            | Event::MessageComplete { ctx, .. }
            | Event::ToolStart { ctx, .. }
            | Event::ToolDelta { ctx, .. }
            | Event::ToolDone { ctx, .. }
            | Event::FileStart { ctx, .. }
            | Event::FileDelta { ctx, .. }
            | Event::FileComplete { ctx, .. }
            | Event::AudioStream { ctx, .. }
            | Event::CostUpdate { ctx, .. }
            | Event::ResponseOutput { ctx, .. }
            | Event::AgentStart { ctx, .. }
            | Event::AgentStatus { ctx, .. }
            | Event::AgentDone { ctx, .. }
            | Event::Error { ctx, .. }
            | Event::StreamEnd { ctx } => ctx,
        }
    }

    pub fn context_mut(&mut self) -> &mut EventContext {
        match self {
            Event::MessageStart { ctx, .. }
            | Event::MessageDelta { ctx, .. }
            | Event::MessageComplete { ctx, .. }
            | Event::ToolStart { ctx, .. }
            | Event::ToolDelta { ctx, .. }
            | Event::ToolDone { ctx, .. }
            | Event::FileStart { ctx, .. }
            | Event::FileDelta { ctx, .. }
            | Event::FileComplete { ctx, .. }
            | Event::AudioStream { ctx, .. }
            | Event::CostUpdate { ctx, .. }
            | Event::ResponseOutput { ctx, .. }
            | Event::AgentStart { ctx, .. }
            | Event::AgentStatus { ctx, .. }
            | Event::AgentDone { ctx, .. }
            | Event::Error { ctx, .. }
            | Event::StreamEnd { ctx } => ctx,
        }
    }

    /// Tag the event with agent identity and request id, filling the
    /// timestamp if unset.  Existing tags are not overwritten so nested
    /// agents keep their own identity on forwarded events.
    pub fn tagged(mut self, agent: &AgentTag, request_id: &str) -> Self {
        let ctx = self.context_mut();
        if ctx.agent.is_none() {
            ctx.agent = Some(agent.clone());
        }
        if ctx.request_id.is_none() {
            ctx.request_id = Some(request_id.to_string());
        }
        if ctx.timestamp.is_none() {
            ctx.timestamp = Some(Utc::now());
        }
        self
    }

    /// Convenience constructor for a bare text delta.
    pub fn delta(message_id: impl Into<String>, content: impl Into<String>) -> Self {
        Event::MessageDelta {
            message_id: message_id.into(),
            content: content.into(),
            thinking_content: None,
            thinking_signature: None,
            ctx: EventContext::default(),
        }
    }

    /// Convenience constructor for an error event.
    pub fn error(error: impl Into<String>, code: Option<String>) -> Self {
        Event::Error {
            error: error.into(),
            code,
            ctx: EventContext::default(),
        }
    }

    pub fn stream_end() -> Self {
        Event::StreamEnd {
            ctx: EventContext::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::StreamEnd { .. } | Event::Error { .. })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialise_with_snake_case_type_tag() {
        let ev = Event::delta("m1", "hi");
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"message_delta""#));
        assert!(json.contains(r#""message_id":"m1""#));
        assert!(json.contains(r#""content":"hi""#));
    }

    #[test]
    fn stream_end_serialises_to_type_only() {
        let json = serde_json::to_string(&Event::stream_end()).unwrap();
        assert_eq!(json, r#"{"type":"stream_end"}"#);
    }

    #[test]
    fn tool_start_round_trips() {
        let ev = Event::ToolStart {
            tool_call: ToolCall {
                id: None,
                call_id: "c1".into(),
                function: FunctionSpec {
                    name: "add".into(),
                    arguments: r#"{"x":2,"y":3}"#.into(),
                },
            },
            ctx: EventContext::default(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"tool_start""#));
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn tagging_sets_agent_request_and_timestamp() {
        let tag = AgentTag {
            agent_id: "a1".into(),
            name: "worker".into(),
            parent_id: None,
        };
        let ev = Event::delta("m1", "x").tagged(&tag, "req-1");
        let ctx = ev.context();
        assert_eq!(ctx.agent.as_ref().unwrap().agent_id, "a1");
        assert_eq!(ctx.request_id.as_deref(), Some("req-1"));
        assert!(ctx.timestamp.is_some());
    }

    #[test]
    fn tagging_does_not_overwrite_existing_agent() {
        let inner = AgentTag {
            agent_id: "child".into(),
            name: "child".into(),
            parent_id: Some("parent".into()),
        };
        let outer = AgentTag {
            agent_id: "parent".into(),
            name: "parent".into(),
            parent_id: None,
        };
        let mut ev = Event::delta("m1", "x");
        ev.context_mut().agent = Some(inner.clone());
        let ev = ev.tagged(&outer, "req");
        assert_eq!(ev.context().agent.as_ref().unwrap().agent_id, "child");
    }

    #[test]
    fn error_event_is_terminal() {
        assert!(Event::error("boom", None).is_terminal());
        assert!(Event::stream_end().is_terminal());
        assert!(!Event::delta("m", "x").is_terminal());
    }

    #[test]
    fn data_format_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&DataFormat::Base64).unwrap(),
            r#""base64""#
        );
    }

    #[test]
    fn wire_shape_matches_taxonomy_for_audio() {
        let ev = Event::AudioStream {
            chunk_index: 0,
            is_final_chunk: true,
            data: "AAAA".into(),
            format: "mp3".into(),
            pcm_parameters: None,
            ctx: EventContext::default(),
        };
        let v: serde_json::Value = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "audio_stream");
        assert_eq!(v["chunk_index"], 0);
        assert_eq!(v["is_final_chunk"], true);
    }
}
