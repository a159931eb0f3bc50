// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Generic OpenAI-compatible streaming adapter.
//!
//! Most hosted backends speak the same `/chat/completions` SSE wire format;
//! this adapter covers all of them from one implementation, configured with
//! a base URL and auth style.  Provider-specific encoders stay external —
//! they implement [`ProviderAdapter`] themselves and reuse the free
//! functions here (SSE framing, usage extraction, message building).
//!
//! # Auth styles
//! - `Bearer` — `Authorization: Bearer <key>` (most providers)
//! - `ApiKeyHeader` — `api-key: <key>` header
//! - `None` — no authentication (local servers)

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use ensemble_config::ToolChoice;

use crate::{
    cost::{CostTracker, UsagePartial},
    error::ProviderError,
    events::{Event, EventContext, FunctionSpec, ToolCall},
    provider::{EmbedOptions, EventStream, ProviderAdapter, StreamOptions},
    registry,
    types::{ChatRole, ContentPart, Message, MessageContent},
};

/// How to send the API key in HTTP requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    Bearer,
    ApiKeyHeader,
    None,
}

/// OpenAI-compatible chat completion adapter.
pub struct HttpAdapter {
    provider_id: String,
    api_key: Option<String>,
    chat_url: String,
    embeddings_url: String,
    client: reqwest::Client,
    extra_headers: Vec<(String, String)>,
    auth_style: AuthStyle,
}

impl HttpAdapter {
    /// Construct an adapter from a base URL that ends before
    /// `/chat/completions`.
    pub fn new(
        provider_id: impl Into<String>,
        base_url: &str,
        api_key: Option<String>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            provider_id: provider_id.into(),
            api_key,
            chat_url: format!("{base}/chat/completions"),
            embeddings_url: format!("{base}/embeddings"),
            client: reqwest::Client::new(),
            extra_headers: Vec::new(),
            auth_style: AuthStyle::Bearer,
        }
    }

    /// Construct from the provider registry: default base URL plus the API
    /// key from the provider's environment variable.
    pub fn from_registry(provider_id: &str) -> Result<Self, ProviderError> {
        let meta = registry::get_provider(provider_id)
            .ok_or_else(|| ProviderError::NoProvider(provider_id.to_string()))?;
        let base = meta.default_base_url.ok_or_else(|| {
            ProviderError::NoProvider(format!("{provider_id} has no default base URL"))
        })?;
        let api_key = meta
            .api_key_env
            .and_then(|var| std::env::var(var).ok())
            .filter(|k| !k.is_empty());
        Ok(Self::new(provider_id, base, api_key))
    }

    pub fn with_auth_style(mut self, style: AuthStyle) -> Self {
        self.auth_style = style;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    fn apply_auth(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ProviderError> {
        let need_key = || {
            self.api_key.as_deref().ok_or_else(|| {
                ProviderError::Authentication(format!(
                    "no API key configured for provider {}",
                    self.provider_id
                ))
            })
        };
        let mut req = match self.auth_style {
            AuthStyle::Bearer => req.bearer_auth(need_key()?),
            AuthStyle::ApiKeyHeader => req.header("api-key", need_key()?),
            AuthStyle::None => req,
        };
        for (name, val) in &self.extra_headers {
            req = req.header(name.as_str(), val.as_str());
        }
        Ok(req)
    }
}

#[async_trait]
impl ProviderAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.provider_id
    }

    async fn open_stream(
        &self,
        messages: &[Message],
        model: &str,
        opts: &StreamOptions,
    ) -> Result<EventStream, ProviderError> {
        let body = build_request_body(messages, model, opts);
        debug!(
            provider = %self.provider_id,
            model,
            message_count = messages.len(),
            tool_count = opts.tools.len(),
            "sending completion request"
        );

        let req = self.apply_auth(self.client.post(&self.chat_url).json(&body))?;
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::StreamInterrupted(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::classify(Some(status), &text));
        }

        let input_text: String = messages
            .iter()
            .filter_map(|m| m.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        let state = SseState::new(
            model.to_string(),
            opts.request_id.clone(),
            opts.cost.clone(),
            input_text,
        );

        let byte_stream = resp.bytes_stream();
        let events = futures::stream::unfold(
            (byte_stream, state, false),
            |(mut bytes, mut state, finished)| async move {
                if finished || state.done {
                    return None;
                }
                loop {
                    match bytes.next().await {
                        Some(Ok(chunk)) => {
                            let out = state.push_bytes(&chunk);
                            if !out.is_empty() {
                                return Some((out, (bytes, state, false)));
                            }
                        }
                        Some(Err(e)) => {
                            let out =
                                vec![Err(ProviderError::StreamInterrupted(e.to_string()))];
                            return Some((out, (bytes, state, true)));
                        }
                        None => {
                            // Upstream closed without [DONE]; flush what we have.
                            let out = state.finish();
                            return Some((out, (bytes, state, true)));
                        }
                    }
                }
            },
        )
        .map(futures::stream::iter)
        .flatten();

        Ok(Box::pin(events))
    }

    async fn create_embedding(
        &self,
        text: &str,
        model: &str,
        opts: &EmbedOptions,
    ) -> Result<Vec<f32>, ProviderError> {
        let mut body = json!({ "model": model, "input": text });
        if let Some(d) = opts.dimensions {
            body["dimensions"] = json!(d);
        }
        let req = self.apply_auth(self.client.post(&self.embeddings_url).json(&body))?;
        let resp = req
            .send()
            .await
            .map_err(|e| ProviderError::StreamInterrupted(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::classify(Some(status), &text));
        }
        let v: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Provider(e.to_string()))?;
        let embedding = v["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| ProviderError::Provider("no embedding in response".into()))?
            .iter()
            .filter_map(|x| x.as_f64().map(|f| f as f32))
            .collect();
        Ok(embedding)
    }
}

// ─── Request building ─────────────────────────────────────────────────────────

/// Build the chat completion request body.
///
/// Extracted as a free function so provider-specific adapters can reuse it
/// and so it unit-tests without HTTP.
pub fn build_request_body(messages: &[Message], model: &str, opts: &StreamOptions) -> Value {
    let mut body = json!({
        "model": model,
        "messages": build_wire_messages(messages),
        "stream": true,
        "stream_options": { "include_usage": true },
    });
    let s = &opts.settings;
    if let Some(t) = s.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = s.top_p {
        body["top_p"] = json!(p);
    }
    if let Some(m) = s.max_tokens {
        body["max_tokens"] = json!(m);
    }
    if let Some(tier) = &s.service_tier {
        body["service_tier"] = json!(tier);
    }
    if let Some(schema) = &s.json_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": schema,
        });
    }
    if !opts.tools.is_empty() {
        let tools: Vec<Value> = opts
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
        if let Some(choice) = &s.tool_choice {
            body["tool_choice"] = match choice {
                ToolChoice::Auto => json!("auto"),
                ToolChoice::None => json!("none"),
                ToolChoice::Required => json!("required"),
                ToolChoice::Named(name) => json!({
                    "type": "function",
                    "function": { "name": name },
                }),
            };
        }
    }
    body
}

/// Convert the internal message list into the OpenAI wire-format array.
///
/// Consecutive `FunctionCall` messages are coalesced into a single assistant
/// message with a `tool_calls` array, which is what the wire format requires
/// for parallel tool calls.
pub fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out: Vec<Value> = Vec::with_capacity(messages.len());
    let mut i = 0;
    while i < messages.len() {
        match &messages[i] {
            Message::Chat { role, content, .. } => {
                let role = match role {
                    ChatRole::System => "system",
                    ChatRole::User => "user",
                    ChatRole::Developer => "developer",
                };
                out.push(json!({ "role": role, "content": content_to_wire(content) }));
                i += 1;
            }
            Message::Assistant { content, .. } => {
                out.push(json!({ "role": "assistant", "content": content_to_wire(content) }));
                i += 1;
            }
            Message::FunctionCall { .. } => {
                let mut tool_calls: Vec<Value> = Vec::new();
                while let Some(Message::FunctionCall {
                    call_id,
                    name,
                    arguments,
                    ..
                }) = messages.get(i)
                {
                    tool_calls.push(json!({
                        "id": call_id,
                        "type": "function",
                        "function": { "name": name, "arguments": arguments },
                    }));
                    i += 1;
                }
                out.push(json!({ "role": "assistant", "tool_calls": tool_calls }));
            }
            Message::FunctionCallOutput {
                call_id, output, ..
            } => {
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": call_id,
                    "content": output,
                }));
                i += 1;
            }
        }
    }
    out
}

fn content_to_wire(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(t) => json!(t),
        MessageContent::Parts(parts) => {
            let arr: Vec<Value> = parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => json!({ "type": "text", "text": text }),
                    ContentPart::ImageRef { image_url } => json!({
                        "type": "image_url",
                        "image_url": { "url": image_url },
                    }),
                    ContentPart::FileRef { file_id, .. } => json!({
                        "type": "file",
                        "file": { "file_id": file_id },
                    }),
                })
                .collect();
            json!(arr)
        }
    }
}

// ─── SSE decoding ─────────────────────────────────────────────────────────────

/// A decoded fragment of one SSE chunk, before canonicalisation.
#[derive(Debug, Clone, PartialEq)]
pub enum SseDelta {
    Text(String),
    Thinking(String),
    ToolFragment {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage {
        input_tokens: u64,
        output_tokens: u64,
        cached_tokens: u64,
    },
    Done,
}

/// Drain all complete `\n`-terminated SSE lines from `buf` into deltas.
///
/// Any trailing incomplete line is left in `buf` so it can be extended by
/// the next TCP chunk — a single SSE event may be split across packets.
pub fn drain_sse_lines(buf: &mut String) -> Vec<SseDelta> {
    let mut out = Vec::new();
    while let Some(nl) = buf.find('\n') {
        let line = buf[..nl].trim_end_matches('\r').to_string();
        *buf = buf[nl + 1..].to_string();
        if let Some(delta) = parse_sse_line(&line) {
            out.push(delta);
        }
    }
    out
}

/// Parse a single complete SSE `data:` line.  Returns `None` for empty
/// lines, comments, and unparseable payloads.
pub fn parse_sse_line(line: &str) -> Option<SseDelta> {
    let data = line.strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(SseDelta::Done);
    }
    let v: Value = serde_json::from_str(data).ok()?;
    parse_sse_chunk(&v)
}

/// Decode one parsed SSE JSON chunk.
pub fn parse_sse_chunk(v: &Value) -> Option<SseDelta> {
    // Usage-only chunk (stream_options.include_usage).  Cached tokens are
    // reported as prompt_tokens_details.cached_tokens by OpenAI and as
    // prompt_cache_hit_tokens by DeepSeek; accept both.
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        let cached = usage
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64)
            .or_else(|| usage.get("prompt_cache_hit_tokens").and_then(Value::as_u64))
            .unwrap_or(0);
        return Some(SseDelta::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0),
            cached_tokens: cached,
        });
    }

    let delta = &v["choices"][0]["delta"];

    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return Some(SseDelta::ToolFragment {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        });
    }

    // Reasoning deltas arrive as reasoning_content (DeepSeek, xAI) or
    // reasoning (OpenRouter).
    let thinking = delta
        .get("reasoning_content")
        .and_then(Value::as_str)
        .or_else(|| delta.get("reasoning").and_then(Value::as_str));
    if let Some(t) = thinking.filter(|t| !t.is_empty()) {
        return Some(SseDelta::Thinking(t.to_string()));
    }

    delta
        .get("content")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(|t| SseDelta::Text(t.to_string()))
}

/// Stream state: canonicalises [`SseDelta`]s into [`Event`]s.
struct SseState {
    buf: String,
    model: String,
    request_id: Option<String>,
    cost: Option<Arc<CostTracker>>,
    input_text: String,
    message_id: String,
    started: bool,
    content: String,
    pending_tools: BTreeMap<u32, (String, FunctionSpec)>,
    usage_reported: bool,
    done: bool,
}

impl SseState {
    fn new(
        model: String,
        request_id: Option<String>,
        cost: Option<Arc<CostTracker>>,
        input_text: String,
    ) -> Self {
        Self {
            buf: String::new(),
            model,
            request_id,
            cost,
            input_text,
            message_id: Uuid::new_v4().to_string(),
            started: false,
            content: String::new(),
            pending_tools: BTreeMap::new(),
            usage_reported: false,
            done: false,
        }
    }

    fn push_bytes(&mut self, chunk: &[u8]) -> Vec<Result<Event, ProviderError>> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let deltas = drain_sse_lines(&mut self.buf);
        let mut out = Vec::new();
        for delta in deltas {
            self.canonicalize(delta, &mut out);
            if self.done {
                break;
            }
        }
        out
    }

    fn canonicalize(&mut self, delta: SseDelta, out: &mut Vec<Result<Event, ProviderError>>) {
        match delta {
            SseDelta::Text(text) => {
                self.ensure_started(out);
                self.content.push_str(&text);
                out.push(Ok(Event::delta(self.message_id.clone(), text)));
            }
            SseDelta::Thinking(text) => {
                self.ensure_started(out);
                out.push(Ok(Event::MessageDelta {
                    message_id: self.message_id.clone(),
                    content: String::new(),
                    thinking_content: Some(text),
                    thinking_signature: None,
                    ctx: EventContext::default(),
                }));
            }
            SseDelta::ToolFragment {
                index,
                id,
                name,
                arguments,
            } => {
                if let Some((call_id, _)) = self.pending_tools.get(&index) {
                    // Continuation: argument bytes for an announced call.
                    out.push(Ok(Event::ToolDelta {
                        tool_call_id: call_id.clone(),
                        arguments_delta: arguments,
                        ctx: EventContext::default(),
                    }));
                } else {
                    if name.is_empty() {
                        warn!(index, "tool fragment without a name; dropping");
                        return;
                    }
                    let call_id = if id.is_empty() {
                        format!("call_{}", Uuid::new_v4().simple())
                    } else {
                        id
                    };
                    let spec = FunctionSpec {
                        name,
                        arguments: arguments.clone(),
                    };
                    self.pending_tools.insert(index, (call_id.clone(), spec.clone()));
                    out.push(Ok(Event::ToolStart {
                        tool_call: ToolCall {
                            id: Some(call_id.clone()),
                            call_id,
                            function: spec,
                        },
                        ctx: EventContext::default(),
                    }));
                }
            }
            SseDelta::Usage {
                input_tokens,
                output_tokens,
                cached_tokens,
            } => {
                if let Some(cost) = &self.cost {
                    let record = cost.add_usage(UsagePartial {
                        model: self.model.clone(),
                        input_tokens,
                        output_tokens,
                        cached_tokens: (cached_tokens > 0).then_some(cached_tokens),
                        request_id: self.request_id.clone(),
                        ..Default::default()
                    });
                    self.usage_reported = true;
                    out.push(Ok(Event::CostUpdate {
                        usage: record,
                        ctx: EventContext::default(),
                    }));
                }
            }
            SseDelta::Done => {
                let flush = self.finish();
                out.extend(flush);
            }
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<Result<Event, ProviderError>>) {
        if !self.started {
            self.started = true;
            out.push(Ok(Event::MessageStart {
                message_id: self.message_id.clone(),
                role: "assistant".into(),
                ctx: EventContext::default(),
            }));
        }
    }

    /// Terminal flush: complete the message, estimate usage when the wire
    /// never carried any, and end the stream.
    fn finish(&mut self) -> Vec<Result<Event, ProviderError>> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut out = Vec::new();
        if self.started {
            out.push(Ok(Event::MessageComplete {
                message_id: self.message_id.clone(),
                content: self.content.clone(),
                thinking_content: None,
                thinking_signature: None,
                ctx: EventContext::default(),
            }));
            out.push(Ok(Event::ResponseOutput {
                message: Message::assistant(self.content.clone()).with_model(self.model.clone()),
                ctx: EventContext::default(),
            }));
        }
        if !self.usage_reported {
            if let Some(cost) = &self.cost {
                let record = cost.add_estimated_usage(
                    &self.model,
                    &self.input_text,
                    &self.content,
                    self.request_id.clone(),
                );
                out.push(Ok(Event::CostUpdate {
                    usage: record,
                    ctx: EventContext::default(),
                }));
            }
        }
        out.push(Ok(Event::stream_end()));
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
