// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The multi-round agent loop.
//!
//! Drives provider streams, executes requested tools between rounds,
//! enforces call/round budgets, appends each round to history under the
//! call/output pairing invariant, retries retryable provider failures with
//! exponential backoff, and optionally gates the final response through a
//! verifier agent.  Callers consume one canonical event stream terminated
//! by `stream_end` or a single terminal `error`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use ensemble_model::{
    catalog,
    events::{AgentStatus, EventContext},
    AgentTag, Event, EventStream, Message, ModelSelector, ProviderAdapter, ProviderError,
    SelectionRequest, StreamOptions, Summarizer, ToolCall,
};
use ensemble_tools::{ExecutionContext, SummaryStore, ToolExecutionManager};

use crate::{agent::AgentDefinition, history::MessageHistory, runtime::Runtime};

/// Fallback context window for models missing from the catalog.
const DEFAULT_CONTEXT_LENGTH: u32 = 128_000;

/// Per-request options.
#[derive(Default)]
pub struct RequestOptions {
    pub request_id: Option<String>,
    /// Abort handle; cancelling closes the provider stream, aborts running
    /// tools, and rejects queued sequential work for this agent.
    pub cancel: Option<CancellationToken>,
}

/// The agent loop driver.
pub struct RequestOrchestrator {
    runtime: Arc<Runtime>,
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    summaries: Option<Arc<SummaryStore>>,
}

impl RequestOrchestrator {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            providers: HashMap::new(),
            summarizer: None,
            summaries: None,
        }
    }

    /// Register the adapter serving one provider id from the catalog.
    pub fn register_provider(
        &mut self,
        provider_id: impl Into<String>,
        adapter: Arc<dyn ProviderAdapter>,
    ) {
        self.providers.insert(provider_id.into(), adapter);
    }

    /// Enable LLM-backed history compaction and tool-result summarization.
    pub fn with_summarizer(
        mut self,
        summarizer: Arc<dyn Summarizer>,
        store: Option<Arc<SummaryStore>>,
    ) -> Self {
        self.summarizer = Some(summarizer);
        self.summaries = store;
        self
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Run one request.  Returns immediately with the event stream; the
    /// loop runs on a background task and stops when the caller drops the
    /// stream.
    pub fn run(
        self: &Arc<Self>,
        messages: Vec<Message>,
        agent: Arc<AgentDefinition>,
        opts: RequestOptions,
    ) -> EventStream {
        if messages.is_empty() {
            let err = ProviderError::Validation("request must contain at least one message".into());
            let event = Event::error(err.to_string(), Some(err.code().to_string()));
            return Box::pin(futures::stream::iter(vec![Ok(event)]));
        }

        let (tx, rx) = mpsc::channel::<Result<Event, ProviderError>>(256);
        let orchestrator = Arc::clone(self);
        let request_id = opts
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel = opts.cancel.unwrap_or_default();
        tokio::spawn(async move {
            orchestrator
                .drive(messages, agent, request_id, cancel, tx)
                .await;
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn drive(
        &self,
        messages: Vec<Message>,
        agent: Arc<AgentDefinition>,
        request_id: String,
        cancel: CancellationToken,
        tx: mpsc::Sender<Result<Event, ProviderError>>,
    ) {
        let emitter = Emitter {
            tx,
            request_id,
            hooks: agent.hooks.clone(),
        };
        let tag = agent.tag();

        let input = messages.iter().rev().find_map(|m| m.as_text());
        if emitter
            .send(
                &tag,
                Event::AgentStart {
                    agent: tag.clone(),
                    input,
                    ctx: EventContext::default(),
                },
            )
            .await
            .is_err()
        {
            return;
        }

        let mut history = MessageHistory::from_messages(
            DEFAULT_CONTEXT_LENGTH as usize,
            messages,
        );
        history.compaction_threshold = agent.compaction.threshold;
        history.keep_recent_fraction = agent.compaction.keep_recent_fraction;

        let mut verification_attempts = 0u32;
        let final_output = loop {
            let outcome = self
                .run_agent_loop(&agent, &mut history, &emitter, &cancel)
                .await;
            match outcome {
                LoopOutcome::Terminated => {
                    self.release(&agent.agent_id);
                    return;
                }
                LoopOutcome::Halted { output } => break output,
                LoopOutcome::Completed { text } => {
                    match self.verify(&agent, &text, &emitter, &cancel).await {
                        Verdict::Pass => break text,
                        Verdict::Fail { reason } => {
                            let _ = emitter
                                .send(
                                    &tag,
                                    Event::delta(
                                        Uuid::new_v4().to_string(),
                                        format!("Verification failed: {reason}"),
                                    ),
                                )
                                .await;
                            verification_attempts += 1;
                            if verification_attempts >= agent.limits.max_verification_attempts {
                                let _ = emitter
                                    .send(
                                        &tag,
                                        Event::delta(
                                            Uuid::new_v4().to_string(),
                                            format!(
                                                "❌ Verification failed after \
                                                 {verification_attempts} attempts"
                                            ),
                                        ),
                                    )
                                    .await;
                                break text;
                            }
                            history.push(Message::system(format!(
                                "Your previous response failed verification: {reason}. \
                                 Address the problem and answer again."
                            )));
                        }
                    }
                }
            }
        };

        let _ = emitter
            .send(
                &tag,
                Event::AgentDone {
                    agent: tag.clone(),
                    output: Some(final_output),
                    ctx: EventContext::default(),
                },
            )
            .await;
        let _ = emitter.send(&tag, Event::stream_end()).await;
    }

    /// The round loop for one agent over one history.
    async fn run_agent_loop(
        &self,
        agent: &Arc<AgentDefinition>,
        history: &mut MessageHistory,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> LoopOutcome {
        let tag = agent.tag();
        let selector = ModelSelector::new(Arc::clone(&self.runtime.quota));
        let mut round = 0u32;
        let mut total_tool_calls = 0u32;
        let mut limit_delta_sent = false;
        let mut last_text = String::new();

        loop {
            // Pause is honoured at round boundaries only, so it appears
            // atomic to callers.
            if self.runtime.pause.wait_while_paused(cancel).await.is_err() {
                return self.cancelled(agent, emitter).await;
            }

            if round > agent.limits.max_tool_call_rounds_per_turn {
                let _ = emitter
                    .send(
                        &tag,
                        Event::delta(
                            Uuid::new_v4().to_string(),
                            "Tool call rounds limit reached",
                        ),
                    )
                    .await;
                return LoopOutcome::Completed { text: last_text };
            }

            // Resolve a concrete model for this round.
            let selection = SelectionRequest {
                model: agent.model.as_deref(),
                model_class: agent.model_class.as_deref(),
                disabled_models: &agent.disabled_models,
                model_scores: Some(&agent.model_scores),
            };
            let model = match selector.select(&selection) {
                Ok(m) => m,
                Err(e) => return self.fail(&tag, emitter, e).await,
            };
            let provider_id = match catalog::lookup(&model) {
                Some(entry) => entry.provider,
                None => {
                    return self
                        .fail(&tag, emitter, ProviderError::ModelNotFound(model))
                        .await
                }
            };
            let Some(adapter) = self.providers.get(&provider_id) else {
                return self
                    .fail(&tag, emitter, ProviderError::NoProvider(provider_id))
                    .await;
            };
            history.context_length =
                catalog::context_length(&model, DEFAULT_CONTEXT_LENGTH) as usize;

            let stream_opts = StreamOptions {
                settings: agent.settings.clone(),
                tools: agent.tools.schemas(),
                request_id: Some(emitter.request_id.clone()),
                cost: Some(Arc::clone(&self.runtime.cost)),
            };

            // One round, retried from scratch on retryable failures.
            let mut attempt = 0u32;
            let (text, tool_calls) = loop {
                let round_messages = history.normalized();
                let opened = adapter
                    .open_stream(&round_messages, &model, &stream_opts)
                    .await;
                let consumed = match opened {
                    Ok(stream) => self.consume_stream(stream, &tag, emitter, cancel).await,
                    Err(e) => Consumed::ProviderFailure(e),
                };
                match consumed {
                    Consumed::Finished { text, tool_calls } => break (text, tool_calls),
                    Consumed::Closed => return LoopOutcome::Terminated,
                    Consumed::Cancelled => return self.cancelled(agent, emitter).await,
                    Consumed::ProviderFailure(e) => {
                        if e.is_retryable() && attempt < agent.retry.max_retries {
                            attempt += 1;
                            let delay_ms = e
                                .retry_after()
                                .map(|s| s * 1000)
                                .unwrap_or_else(|| agent.retry.delay_for_attempt(attempt - 1));
                            debug!(
                                attempt,
                                delay_ms,
                                error = %e,
                                "retryable provider failure; backing off"
                            );
                            tokio::select! {
                                _ = tokio::time::sleep(
                                    tokio::time::Duration::from_millis(delay_ms)) => {}
                                _ = cancel.cancelled() => {
                                    return self.cancelled(agent, emitter).await;
                                }
                            }
                            continue;
                        }
                        return self.fail(&tag, emitter, e).await;
                    }
                }
            };

            if !text.is_empty() {
                last_text = text.clone();
            }

            // Tool phase: budget gate, then dispatch in parallel (or through
            // the sequential lane) with tool_start/tool_done around each.
            let mut accepted: Vec<ToolCall> = Vec::new();
            for call in tool_calls {
                if total_tool_calls >= agent.limits.max_tool_calls {
                    if !limit_delta_sent {
                        limit_delta_sent = true;
                        let _ = emitter
                            .send(
                                &tag,
                                Event::delta(
                                    Uuid::new_v4().to_string(),
                                    "Total tool calls limit reached",
                                ),
                            )
                            .await;
                    }
                    continue;
                }
                total_tool_calls += 1;
                accepted.push(call);
            }

            let executed = self
                .execute_tools(agent, &accepted, &tag, emitter)
                .await;
            let executed = match executed {
                Ok(e) => e,
                Err(EmitterClosed) => return LoopOutcome::Terminated,
            };

            // Special tools end the loop: their output is the halt outcome
            // and no function_call_output lands in history.
            if let Some((call, result)) = executed.iter().find(|(c, _)| {
                c.function.name == "task_complete" || c.function.name == "task_fatal_error"
            }) {
                if !text.is_empty() {
                    history.push(Message::assistant(text.clone()).with_model(model.clone()));
                }
                let output = result
                    .output
                    .clone()
                    .or_else(|| result.error.clone())
                    .unwrap_or_default();
                debug!(tool = %call.function.name, "agent halted by special tool");
                return LoopOutcome::Halted { output };
            }

            // Atomic round append: assistant message, then each call paired
            // with its output.  Errors become the output content so the
            // agent can keep going.
            if !text.is_empty() {
                history.push(Message::assistant(text).with_model(model.clone()));
            }
            for (call, result) in &executed {
                let mut fc = Message::function_call(
                    call.call_id.clone(),
                    call.function.name.clone(),
                    call.function.arguments.clone(),
                );
                if let (Message::FunctionCall { id, .. }, Some(provider_id)) = (&mut fc, &call.id)
                {
                    *id = Some(provider_id.clone());
                }
                history.push(fc);
                let output = result
                    .output
                    .clone()
                    .or_else(|| result.error.clone())
                    .unwrap_or_default();
                history.push(Message::function_call_output(
                    call.call_id.clone(),
                    call.function.name.clone(),
                    output,
                ));
            }
            if history.needs_compaction() {
                history.compact(self.summarizer.as_deref()).await;
            }

            round += 1;
            if executed.is_empty() {
                return LoopOutcome::Completed { text: last_text };
            }
        }
    }

    /// Forward one provider stream, collecting text and finalized tool
    /// calls.  Tool-argument deltas are concatenated into the recorded call
    /// so JSON parsing happens exactly once at execution.
    async fn consume_stream(
        &self,
        mut stream: EventStream,
        tag: &AgentTag,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Consumed {
        let mut text = String::new();
        let mut completed: Option<String> = None;
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut call_index: HashMap<String, usize> = HashMap::new();

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = cancel.cancelled() => return Consumed::Cancelled,
            };
            let Some(item) = item else { break };
            match item {
                Ok(Event::StreamEnd { .. }) => break,
                Ok(Event::ToolStart { tool_call, .. }) => {
                    call_index.insert(tool_call.call_id.clone(), tool_calls.len());
                    tool_calls.push(tool_call);
                }
                Ok(Event::ToolDelta {
                    tool_call_id,
                    arguments_delta,
                    ctx,
                }) => {
                    if let Some(&i) = call_index.get(&tool_call_id) {
                        tool_calls[i].function.arguments.push_str(&arguments_delta);
                    }
                    let forwarded = Event::ToolDelta {
                        tool_call_id,
                        arguments_delta,
                        ctx,
                    };
                    if emitter.send(tag, forwarded).await.is_err() {
                        return Consumed::Closed;
                    }
                }
                Ok(Event::Error { error, code, .. }) => {
                    let e = match code.as_deref() {
                        Some("RATE_LIMIT") => ProviderError::RateLimit {
                            message: error,
                            retry_after_seconds: None,
                        },
                        Some("STREAM_INTERRUPTED") => ProviderError::StreamInterrupted(error),
                        _ => ProviderError::Provider(error),
                    };
                    return Consumed::ProviderFailure(e);
                }
                Ok(event) => {
                    match &event {
                        Event::MessageDelta { content, .. } => text.push_str(content),
                        Event::MessageComplete { content, .. } => {
                            completed = Some(content.clone())
                        }
                        _ => {}
                    }
                    if emitter.send(tag, event).await.is_err() {
                        return Consumed::Closed;
                    }
                }
                Err(e) => return Consumed::ProviderFailure(e),
            }
        }

        Consumed::Finished {
            text: completed.unwrap_or(text),
            tool_calls,
        }
    }

    /// Dispatch accepted tool calls, emitting `tool_start`/`tool_done`
    /// around each.  Completion events follow dispatch order.
    async fn execute_tools(
        &self,
        agent: &Arc<AgentDefinition>,
        accepted: &[ToolCall],
        tag: &AgentTag,
        emitter: &Emitter,
    ) -> Result<Vec<(ToolCall, ensemble_model::ToolCallResult)>, EmitterClosed> {
        if accepted.is_empty() {
            return Ok(Vec::new());
        }
        let mut manager = ToolExecutionManager::new(
            Arc::clone(&agent.tools),
            Arc::clone(&self.runtime.running),
            Arc::clone(&self.runtime.queue),
        );
        if let (Some(summarizer), Some(store)) = (&self.summarizer, &self.summaries) {
            manager = manager.with_summarizer(Arc::clone(summarizer), Arc::clone(store));
        }
        let manager = Arc::new(manager);
        let exec_ctx = ExecutionContext {
            agent_id: agent.agent_id.clone(),
            sequential: agent.settings.sequential_tools,
            hooks: agent.hooks.clone(),
        };

        let mut handles = Vec::with_capacity(accepted.len());
        for call in accepted {
            emitter
                .send(
                    tag,
                    Event::ToolStart {
                        tool_call: call.clone(),
                        ctx: EventContext::default(),
                    },
                )
                .await
                .map_err(|_| EmitterClosed)?;
            let manager = Arc::clone(&manager);
            let ctx = exec_ctx.clone();
            let call = call.clone();
            handles.push(tokio::spawn(async move {
                manager.execute(&call, &ctx).await
            }));
        }

        let mut executed = Vec::with_capacity(accepted.len());
        for (i, handle) in handles.into_iter().enumerate() {
            let result = match handle.await {
                Ok(r) => r,
                Err(e) => ensemble_model::ToolCallResult {
                    call_id: accepted[i].call_id.clone(),
                    output: None,
                    error: Some(format!("Tool panicked: {e}")),
                },
            };
            emitter
                .send(
                    tag,
                    Event::ToolDone {
                        tool_call: accepted[i].clone(),
                        result: result.clone(),
                        ctx: EventContext::default(),
                    },
                )
                .await
                .map_err(|_| EmitterClosed)?;
            executed.push((accepted[i].clone(), result));
        }
        Ok(executed)
    }

    /// Gate the candidate output through the agent's verifier, when set.
    async fn verify(
        &self,
        agent: &Arc<AgentDefinition>,
        candidate: &str,
        emitter: &Emitter,
        cancel: &CancellationToken,
    ) -> Verdict {
        let Some(verifier_id) = &agent.verifier else {
            return Verdict::Pass;
        };
        let Some(verifier) = self.runtime.agent(verifier_id) else {
            warn!(%verifier_id, "verifier agent not registered; skipping verification");
            return Verdict::Pass;
        };

        let tag = agent.tag();
        let _ = emitter
            .send(
                &tag,
                Event::AgentStatus {
                    agent: tag.clone(),
                    status: AgentStatus::Verifying,
                    ctx: EventContext::default(),
                },
            )
            .await;

        let prompt = format!(
            "Review the candidate response below and judge whether it is \
             acceptable.\n\nCandidate response:\n{candidate}\n\n\
             Reply with a single JSON object: \
             {{\"status\": \"pass\" | \"fail\", \"reason\": \"...\"}}"
        );
        let mut vhistory = MessageHistory::from_messages(
            DEFAULT_CONTEXT_LENGTH as usize,
            vec![Message::user(prompt)],
        );
        match self
            .run_agent_loop(&verifier, &mut vhistory, emitter, cancel)
            .await
        {
            LoopOutcome::Completed { text } | LoopOutcome::Halted { output: text } => {
                match parse_verdict(&text) {
                    Some(v) => v,
                    None => {
                        warn!("verifier produced no parseable verdict; treating as pass");
                        Verdict::Pass
                    }
                }
            }
            LoopOutcome::Terminated => Verdict::Pass,
        }
    }

    async fn fail(
        &self,
        tag: &AgentTag,
        emitter: &Emitter,
        error: ProviderError,
    ) -> LoopOutcome {
        warn!(code = error.code(), %error, "request failed");
        let _ = emitter
            .send(
                tag,
                Event::error(error.to_string(), Some(error.code().to_string())),
            )
            .await;
        LoopOutcome::Terminated
    }

    /// Cancellation cleanup: abort this agent's running tools, reject its
    /// queued sequential work, and emit the terminal error.
    async fn cancelled(&self, agent: &Arc<AgentDefinition>, emitter: &Emitter) -> LoopOutcome {
        self.release(&agent.agent_id);
        let _ = emitter
            .send(
                &agent.tag(),
                Event::error("request cancelled", Some("cancelled".into())),
            )
            .await;
        LoopOutcome::Terminated
    }

    fn release(&self, agent_id: &str) {
        self.runtime.running.abort_agent_tools(agent_id);
        self.runtime.queue.clear(agent_id);
    }
}

enum LoopOutcome {
    /// Natural end: a round produced no tool calls (or a limit was hit).
    Completed { text: String },
    /// A special tool (`task_complete` / `task_fatal_error`) ended the loop.
    Halted { output: String },
    /// The terminal event (if any) was already emitted; stop silently.
    Terminated,
}

enum Consumed {
    Finished {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    ProviderFailure(ProviderError),
    Cancelled,
    Closed,
}

struct EmitterClosed;

struct Emitter {
    tx: mpsc::Sender<Result<Event, ProviderError>>,
    request_id: String,
    hooks: Option<Arc<dyn ensemble_tools::ToolLifecycleHooks>>,
}

impl Emitter {
    async fn send(&self, tag: &AgentTag, event: Event) -> Result<(), EmitterClosed> {
        let tagged = event.tagged(tag, &self.request_id);
        if let Some(hooks) = &self.hooks {
            if let Err(e) = hooks.on_event(&tagged).await {
                warn!(error = %e, "on_event hook failed");
            }
        }
        self.tx.send(Ok(tagged)).await.map_err(|_| EmitterClosed)
    }
}

#[derive(Debug, Deserialize)]
struct VerifierReply {
    status: String,
    #[serde(default)]
    reason: Option<String>,
}

enum Verdict {
    Pass,
    Fail { reason: String },
}

/// Extract the `{status, reason}` verdict from the verifier's text.
fn parse_verdict(text: &str) -> Option<Verdict> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    let reply: VerifierReply = serde_json::from_str(&text[start..=end]).ok()?;
    match reply.status.as_str() {
        "pass" => Some(Verdict::Pass),
        "fail" => Some(Verdict::Fail {
            reason: reply
                .reason
                .unwrap_or_else(|| "no reason given".to_string()),
        }),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
