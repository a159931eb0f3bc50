// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic test provider.
//!
//! Behaviour is configured entirely through a plain record
//! ([`TestProviderConfig`]) so tests read as data, not as mock plumbing.
//! A provider holds an ordered script of configs; each `open_stream` call
//! consumes the next one, which lets a single test describe a multi-round
//! conversation (tool call round, then text round).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::Duration;
use uuid::Uuid;

use crate::{
    error::ProviderError,
    events::{Event, EventContext, FunctionSpec, ToolCall},
    provider::{EmbedOptions, EventStream, ProviderAdapter, StreamOptions},
    types::Message,
};

/// A provider failure to simulate.
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedError {
    RateLimit { retry_after_seconds: Option<u64> },
    Authentication,
    StreamInterrupted,
    Provider(String),
}

impl From<&SimulatedError> for ProviderError {
    fn from(e: &SimulatedError) -> Self {
        match e {
            SimulatedError::RateLimit {
                retry_after_seconds,
            } => ProviderError::RateLimit {
                message: "simulated rate limit".into(),
                retry_after_seconds: *retry_after_seconds,
            },
            SimulatedError::Authentication => {
                ProviderError::Authentication("simulated auth failure".into())
            }
            SimulatedError::StreamInterrupted => {
                ProviderError::StreamInterrupted("simulated stream cut".into())
            }
            SimulatedError::Provider(msg) => ProviderError::Provider(msg.clone()),
        }
    }
}

/// One scripted provider round, as plain data.
#[derive(Debug, Clone)]
pub struct TestProviderConfig {
    /// Text the round streams back.
    pub fixed_response: Option<String>,
    /// When true the round emits a tool call instead of (or before) text.
    pub simulate_tool_call: bool,
    pub tool_name: Option<String>,
    /// JSON arguments for the simulated tool call.
    pub tool_arguments: Option<String>,
    /// Sleep between streamed events.
    pub streaming_delay_ms: Option<u64>,
    /// Fail `open_stream` with this error instead of producing events.
    pub should_error: Option<SimulatedError>,
    /// Characters per text delta.  0 streams the response as one delta.
    pub chunk_size: usize,
}

impl Default for TestProviderConfig {
    fn default() -> Self {
        Self {
            fixed_response: None,
            simulate_tool_call: false,
            tool_name: None,
            tool_arguments: None,
            streaming_delay_ms: None,
            should_error: None,
            chunk_size: 2,
        }
    }
}

impl TestProviderConfig {
    /// A round that streams `text` and ends.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            fixed_response: Some(text.into()),
            ..Default::default()
        }
    }

    /// A round that emits one tool call and ends.
    pub fn tool(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            simulate_tool_call: true,
            tool_name: Some(name.into()),
            tool_arguments: Some(arguments.into()),
            ..Default::default()
        }
    }

    /// A round that fails with the given error.
    pub fn error(err: SimulatedError) -> Self {
        Self {
            should_error: Some(err),
            ..Default::default()
        }
    }
}

/// Deterministic provider driven by a script of [`TestProviderConfig`]s.
///
/// When the script runs out, the last config repeats, so a single-config
/// provider behaves the same on every round.
pub struct TestProvider {
    scripts: Mutex<VecDeque<TestProviderConfig>>,
    repeat: Mutex<Option<TestProviderConfig>>,
    /// Completion calls observed, for idempotence assertions.
    pub call_count: AtomicUsize,
    /// Embedding calls observed.
    pub embed_calls: AtomicUsize,
    /// The last message list and model seen by `open_stream`.
    pub last_request: Mutex<Option<(Vec<Message>, String)>>,
}

impl TestProvider {
    pub fn new(config: TestProviderConfig) -> Self {
        Self::scripted(vec![config])
    }

    pub fn scripted(configs: Vec<TestProviderConfig>) -> Self {
        Self {
            scripts: Mutex::new(configs.into()),
            repeat: Mutex::new(None),
            call_count: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Convenience: always stream the same text.
    pub fn always_text(text: impl Into<String>) -> Self {
        Self::new(TestProviderConfig::text(text))
    }

    /// Convenience: a tool call round followed by a text round.
    pub fn tool_then_text(
        tool_name: impl Into<String>,
        tool_arguments: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::scripted(vec![
            TestProviderConfig::tool(tool_name, tool_arguments),
            TestProviderConfig::text(final_text),
        ])
    }

    fn next_config(&self) -> TestProviderConfig {
        let mut scripts = self.scripts.lock();
        match scripts.pop_front() {
            Some(cfg) => {
                *self.repeat.lock() = Some(cfg.clone());
                cfg
            }
            None => self
                .repeat
                .lock()
                .clone()
                .unwrap_or_else(|| TestProviderConfig::text("[no more scripts]")),
        }
    }
}

#[async_trait]
impl ProviderAdapter for TestProvider {
    fn name(&self) -> &str {
        "test"
    }

    async fn open_stream(
        &self,
        messages: &[Message],
        model: &str,
        opts: &StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some((messages.to_vec(), model.to_string()));

        let cfg = self.next_config();
        if let Some(err) = &cfg.should_error {
            return Err(err.into());
        }

        let mut events: Vec<Result<Event, ProviderError>> = Vec::new();
        let message_id = Uuid::new_v4().to_string();
        let mut output_text = String::new();

        if let Some(text) = &cfg.fixed_response {
            output_text = text.clone();
            events.push(Ok(Event::MessageStart {
                message_id: message_id.clone(),
                role: "assistant".into(),
                ctx: EventContext::default(),
            }));
            let chars: Vec<char> = text.chars().collect();
            let chunk = if cfg.chunk_size == 0 {
                chars.len().max(1)
            } else {
                cfg.chunk_size
            };
            for piece in chars.chunks(chunk) {
                events.push(Ok(Event::delta(
                    message_id.clone(),
                    piece.iter().collect::<String>(),
                )));
            }
            events.push(Ok(Event::MessageComplete {
                message_id: message_id.clone(),
                content: text.clone(),
                thinking_content: None,
                thinking_signature: None,
                ctx: EventContext::default(),
            }));
            events.push(Ok(Event::ResponseOutput {
                message: Message::assistant(text.clone()).with_model(model),
                ctx: EventContext::default(),
            }));
        }

        if cfg.simulate_tool_call {
            let call_id = format!("call_{}", Uuid::new_v4().simple());
            events.push(Ok(Event::ToolStart {
                tool_call: ToolCall {
                    id: Some(call_id.clone()),
                    call_id,
                    function: FunctionSpec {
                        name: cfg.tool_name.clone().unwrap_or_else(|| "noop".into()),
                        arguments: cfg.tool_arguments.clone().unwrap_or_else(|| "{}".into()),
                    },
                },
                ctx: EventContext::default(),
            }));
        }

        if let Some(cost) = &opts.cost {
            let input_text: String = messages
                .iter()
                .filter_map(|m| m.as_text())
                .collect::<Vec<_>>()
                .join("\n");
            let record = cost.add_estimated_usage(
                model,
                &input_text,
                &output_text,
                opts.request_id.clone(),
            );
            events.push(Ok(Event::CostUpdate {
                usage: record,
                ctx: EventContext::default(),
            }));
        }

        events.push(Ok(Event::stream_end()));

        match cfg.streaming_delay_ms {
            Some(ms) if ms > 0 => {
                let delay = Duration::from_millis(ms);
                Ok(Box::pin(futures::stream::iter(events).then(
                    move |ev| async move {
                        tokio::time::sleep(delay).await;
                        ev
                    },
                )))
            }
            _ => Ok(Box::pin(futures::stream::iter(events))),
        }
    }

    async fn create_embedding(
        &self,
        text: &str,
        _model: &str,
        opts: &EmbedOptions,
    ) -> Result<Vec<f32>, ProviderError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let dims = opts.dimensions.unwrap_or(8) as usize;
        // Deterministic pseudo-vector derived from the text length.
        let seed = (text.len() % 97) as f32 / 97.0;
        Ok((0..dims).map(|i| seed + i as f32 * 0.001).collect())
    }
}

/// Shared handle form used by orchestrator tests.
pub type SharedTestProvider = Arc<TestProvider>;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::CostTracker;

    async fn drain(stream: EventStream) -> Vec<Event> {
        stream
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(|e| e.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn text_round_streams_start_deltas_complete_end() {
        let p = TestProvider::always_text("hello");
        let stream = p
            .open_stream(&[Message::user("hi")], "test-model", &StreamOptions::default())
            .await
            .unwrap();
        let events = drain(stream).await;
        assert!(matches!(events[0], Event::MessageStart { .. }));
        let text: String = events
            .iter()
            .filter_map(|e| match e {
                Event::MessageDelta { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello");
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::MessageComplete { content, .. } if content == "hello")));
        assert!(matches!(events.last(), Some(Event::StreamEnd { .. })));
    }

    #[tokio::test]
    async fn tool_round_emits_tool_start() {
        let p = TestProvider::new(TestProviderConfig::tool("add", r#"{"x":2,"y":3}"#));
        let stream = p
            .open_stream(&[Message::user("add")], "test-model", &StreamOptions::default())
            .await
            .unwrap();
        let events = drain(stream).await;
        let tc = events
            .iter()
            .find_map(|e| match e {
                Event::ToolStart { tool_call, .. } => Some(tool_call.clone()),
                _ => None,
            })
            .expect("tool_start expected");
        assert_eq!(tc.function.name, "add");
        assert_eq!(tc.function.arguments, r#"{"x":2,"y":3}"#);
    }

    #[tokio::test]
    async fn scripted_rounds_consume_in_order() {
        let p = TestProvider::tool_then_text("add", "{}", "done");
        let opts = StreamOptions::default();
        let first = drain(p.open_stream(&[], "test-model", &opts).await.unwrap()).await;
        assert!(first.iter().any(|e| matches!(e, Event::ToolStart { .. })));
        let second = drain(p.open_stream(&[], "test-model", &opts).await.unwrap()).await;
        assert!(second
            .iter()
            .any(|e| matches!(e, Event::MessageComplete { content, .. } if content == "done")));
    }

    #[tokio::test]
    async fn exhausted_script_repeats_last_config() {
        let p = TestProvider::always_text("again");
        let opts = StreamOptions::default();
        for _ in 0..3 {
            let events = drain(p.open_stream(&[], "test-model", &opts).await.unwrap()).await;
            assert!(events
                .iter()
                .any(|e| matches!(e, Event::MessageComplete { content, .. } if content == "again")));
        }
        assert_eq!(p.call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn error_config_fails_open_stream() {
        let p = TestProvider::new(TestProviderConfig::error(SimulatedError::RateLimit {
            retry_after_seconds: Some(1),
        }));
        let err = p
            .open_stream(&[], "test-model", &StreamOptions::default())
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "RATE_LIMIT");
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cost_tracker_receives_estimated_usage() {
        let cost = Arc::new(CostTracker::new());
        let p = TestProvider::always_text("out");
        let opts = StreamOptions {
            cost: Some(Arc::clone(&cost)),
            ..Default::default()
        };
        let events = drain(
            p.open_stream(&[Message::user("in")], "test-model", &opts)
                .await
                .unwrap(),
        )
        .await;
        assert!(events.iter().any(|e| matches!(e, Event::CostUpdate { .. })));
        assert_eq!(cost.record_count(), 1);
    }

    #[tokio::test]
    async fn last_request_captures_messages_and_model() {
        let p = TestProvider::always_text("x");
        p.open_stream(&[Message::user("q")], "test-model", &StreamOptions::default())
            .await
            .unwrap();
        let captured = p.last_request.lock().clone().unwrap();
        assert_eq!(captured.1, "test-model");
        assert_eq!(captured.0.len(), 1);
    }

    #[tokio::test]
    async fn embedding_is_deterministic_and_respects_dimensions() {
        let p = TestProvider::always_text("x");
        let a = p
            .create_embedding("abc", "m", &EmbedOptions { dimensions: Some(4) })
            .await
            .unwrap();
        let b = p
            .create_embedding("abc", "m", &EmbedOptions { dimensions: Some(4) })
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
        assert_eq!(p.embed_calls.load(Ordering::SeqCst), 2);
    }
}
