// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message history with hybrid compaction.
//!
//! The log is append-only within a request; compaction is the one rewrite,
//! replacing a contiguous run of old messages with a single synthetic
//! system message built from the micro-log, the extracted key information,
//! and an externally produced summary.  Pinned messages and the recent
//! tail survive verbatim, and a tool call is never separated from its
//! result across the compaction boundary.

use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use ensemble_model::{Message, MessageStatus, Summarizer};

/// Sentinel the synthetic summary message starts with.
pub const SUMMARY_SENTINEL: &str = "[Previous Conversation Summary]";

static PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:/[\w.\-]+){2,}").unwrap());
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s)>"']+"#).unwrap());
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Z][a-zA-Z0-9_]{2,}\b").unwrap());
static DECISION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:will|should|must|decided)\b").unwrap());
static TODO_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"TODO:\s*(.+)").unwrap());

/// A tool the conversation has used, with a one-line purpose.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUsage {
    pub name: String,
    pub purpose: String,
}

/// Best-effort semantic extraction from the conversation.
#[derive(Debug, Clone, Default)]
pub struct ExtractedInfo {
    pub entities: BTreeSet<String>,
    pub decisions: Vec<String>,
    pub todos: Vec<String>,
    pub tools: Vec<ToolUsage>,
}

/// One line of the running conversation digest.
#[derive(Debug, Clone, PartialEq)]
pub struct MicroLogEntry {
    pub role: String,
    pub summary: String,
}

/// Append-only conversation log with automatic compaction.
pub struct MessageHistory {
    messages: Vec<Message>,
    pinned: BTreeSet<usize>,
    micro_log: Vec<MicroLogEntry>,
    extracted: ExtractedInfo,
    /// Compaction trigger as a fraction of the context window.
    pub compaction_threshold: f32,
    /// Fraction of current tokens kept verbatim as the recent tail.
    pub keep_recent_fraction: f32,
    /// Context window of the model this history is sized for.
    pub context_length: usize,
}

impl MessageHistory {
    pub fn new(context_length: usize) -> Self {
        Self {
            messages: Vec::new(),
            pinned: BTreeSet::new(),
            micro_log: Vec::new(),
            extracted: ExtractedInfo::default(),
            compaction_threshold: 0.7,
            keep_recent_fraction: 0.3,
            context_length,
        }
    }

    pub fn from_messages(context_length: usize, messages: Vec<Message>) -> Self {
        let mut h = Self::new(context_length);
        for m in messages {
            h.push(m);
        }
        h
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn micro_log(&self) -> &[MicroLogEntry] {
        &self.micro_log
    }

    pub fn extracted(&self) -> &ExtractedInfo {
        &self.extracted
    }

    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(Message::approx_tokens).sum()
    }

    /// Mark a message immune to compaction.
    pub fn pin_message(&mut self, index: usize) {
        if index < self.messages.len() {
            self.pinned.insert(index);
        }
    }

    pub fn pinned_indices(&self) -> &BTreeSet<usize> {
        &self.pinned
    }

    /// Append without the compaction check.
    pub fn push(&mut self, message: Message) {
        self.micro_log.push(micro_log_entry(&message));
        self.extract(&message);
        self.messages.push(message);
    }

    /// Append, then compact when the estimate crosses the threshold.
    pub async fn add(&mut self, message: Message, summarizer: Option<&dyn Summarizer>) {
        self.push(message);
        if self.needs_compaction() {
            self.compact(summarizer).await;
        }
    }

    pub fn needs_compaction(&self) -> bool {
        self.context_length > 0
            && self.estimated_tokens() as f32
                > self.compaction_threshold * self.context_length as f32
    }

    /// Replace the compactable middle of the log with one synthetic system
    /// message.  No-op when there is nothing to compact.
    pub async fn compact(&mut self, summarizer: Option<&dyn Summarizer>) {
        let Some((compacted, insert_at)) = self.compaction_slice() else {
            return;
        };

        let compacted_set: HashSet<usize> = compacted.iter().copied().collect();
        let source_text = serialize_messages(&self.messages, &compacted_set);

        let summary = match summarizer {
            Some(s) => match s.summarize(&source_text, "conversation history").await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "summarizer failed; using deterministic fallback");
                    fallback_summary(&self.messages, &compacted_set)
                }
            },
            None => fallback_summary(&self.messages, &compacted_set),
        };
        let synthetic = Message::system(self.synthetic_content(&summary));

        // Rebuild: synthetic replaces the compacted run in place; pinned
        // indices are remapped to their new positions.
        let old = std::mem::take(&mut self.messages);
        let old_pinned = std::mem::take(&mut self.pinned);
        let mut inserted = false;
        for (i, msg) in old.into_iter().enumerate() {
            if compacted_set.contains(&i) {
                if i == insert_at && !inserted {
                    inserted = true;
                    self.messages.push(synthetic.clone());
                }
                continue;
            }
            if old_pinned.contains(&i) {
                self.pinned.insert(self.messages.len());
            }
            self.messages.push(msg);
        }
    }

    /// Pick the compactable message indices and the insertion point of the
    /// synthetic message.  Returns `None` when compaction would be a no-op.
    fn compaction_slice(&self) -> Option<(Vec<usize>, usize)> {
        let total_tokens = self.estimated_tokens();
        if self.messages.len() < 3 || total_tokens == 0 {
            return None;
        }

        // System prelude: leading system messages stay.
        let mut prelude_end = 0;
        while prelude_end < self.messages.len() && self.messages[prelude_end].is_system() {
            prelude_end += 1;
        }

        // Recent tail: walk backwards until ~keep_recent_fraction of tokens
        // are preserved verbatim.  The last message always survives.
        let keep_tokens = (total_tokens as f32 * self.keep_recent_fraction) as usize;
        let mut tail_start = self.messages.len();
        let mut tail_tokens = 0usize;
        while tail_start > prelude_end {
            let candidate = tail_start - 1;
            tail_tokens += self.messages[candidate].approx_tokens();
            tail_start = candidate;
            if tail_tokens >= keep_tokens.max(1) {
                break;
            }
        }

        // Tool-call integrity: a result whose call is being compacted must
        // be compacted with it.  Extend the cut past any leading outputs of
        // the tail (unless pinned, in which case retract instead).
        while tail_start < self.messages.len() {
            match &self.messages[tail_start] {
                Message::FunctionCallOutput { .. } if !self.pinned.contains(&tail_start) => {
                    tail_start += 1;
                }
                _ => break,
            }
        }

        let mut compacted: Vec<usize> = (prelude_end..tail_start)
            .filter(|i| !self.pinned.contains(i))
            .collect();

        // Never leave an orphaned call at the end of the compacted run: if
        // its output survives (pinned), the call survives with it.
        while let Some(&last) = compacted.last() {
            if matches!(self.messages[last], Message::FunctionCall { .. })
                && !compacted.contains(&(last + 1))
            {
                compacted.pop();
                continue;
            }
            break;
        }

        if compacted.is_empty() {
            return None;
        }
        let insert_at = compacted[0];
        Some((compacted, insert_at))
    }

    fn synthetic_content(&self, summary: &str) -> String {
        let mut out = String::from(SUMMARY_SENTINEL);
        out.push_str("\n\n## Conversation Flow\n");
        for entry in &self.micro_log {
            out.push_str(&format!("- {}: {}\n", entry.role, entry.summary));
        }
        out.push_str("\n## Key Information\n");
        if !self.extracted.entities.is_empty() {
            let entities: Vec<&str> =
                self.extracted.entities.iter().map(String::as_str).collect();
            out.push_str(&format!("Entities: {}\n", entities.join(", ")));
        }
        for d in &self.extracted.decisions {
            out.push_str(&format!("Decision: {d}\n"));
        }
        for t in &self.extracted.todos {
            out.push_str(&format!("TODO: {t}\n"));
        }
        for t in &self.extracted.tools {
            out.push_str(&format!("Tool {}: {}\n", t.name, t.purpose));
        }
        out.push_str("\n## Summary\n");
        out.push_str(summary);
        out
    }

    fn extract(&mut self, message: &Message) {
        match message {
            Message::FunctionCall {
                name, arguments, ..
            } => {
                if !self.extracted.tools.iter().any(|t| &t.name == name) {
                    self.extracted.tools.push(ToolUsage {
                        name: name.clone(),
                        purpose: first_line_or(arguments, 80),
                    });
                }
            }
            _ => {
                let Some(text) = message.as_text() else { return };
                for m in PATH_RE.find_iter(&text) {
                    self.extracted.entities.insert(m.as_str().to_string());
                }
                for m in URL_RE.find_iter(&text) {
                    self.extracted.entities.insert(m.as_str().to_string());
                }
                for m in IDENT_RE.find_iter(&text) {
                    self.extracted.entities.insert(m.as_str().to_string());
                }
                for sentence in text.split(['.', '!', '?', '\n']) {
                    let sentence = sentence.trim();
                    if !sentence.is_empty() && DECISION_RE.is_match(sentence) {
                        self.extracted.decisions.push(sentence.to_string());
                    }
                }
                for c in TODO_RE.captures_iter(&text) {
                    self.extracted.todos.push(c[1].trim().to_string());
                }
            }
        }
    }

    /// Normalized view: every function call immediately followed by its
    /// matching output, orphans repaired.
    ///
    /// - An output that matches an earlier call is moved directly after it.
    /// - A call with no output anywhere gets a synthetic `incomplete` error
    ///   output.
    /// - An output with no call is demoted to a plain user message prefixed
    ///   `Tool result: <name>`.
    pub fn normalized(&self) -> Vec<Message> {
        normalize_messages(&self.messages)
    }
}

/// See [`MessageHistory::normalized`].
pub fn normalize_messages(messages: &[Message]) -> Vec<Message> {
    let mut consumed: HashSet<usize> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for (i, msg) in messages.iter().enumerate() {
        match msg {
            Message::FunctionCall { call_id, name, .. } => {
                out.push(msg.clone());
                let output_idx = messages.iter().enumerate().position(|(j, m)| {
                    j > i
                        && !consumed.contains(&j)
                        && matches!(m, Message::FunctionCallOutput { call_id: out_id, .. } if out_id == call_id)
                });
                match output_idx {
                    Some(j) => {
                        consumed.insert(j);
                        out.push(messages[j].clone());
                    }
                    None => {
                        out.push(
                            Message::function_call_output(
                                call_id.clone(),
                                name.clone(),
                                format!("Error: tool call {call_id} produced no result"),
                            )
                            .with_status(MessageStatus::Incomplete),
                        );
                    }
                }
            }
            Message::FunctionCallOutput { name, output, .. } => {
                if !consumed.contains(&i) {
                    // Orphaned output: no call claimed it.
                    out.push(Message::user(format!("Tool result: {name}: {output}")));
                }
            }
            _ => out.push(msg.clone()),
        }
    }
    out
}

fn micro_log_entry(message: &Message) -> MicroLogEntry {
    match message {
        Message::Chat { role, content, .. } => MicroLogEntry {
            role: format!("{role:?}").to_lowercase(),
            summary: first_line_or(&content.as_text(), 80),
        },
        Message::Assistant { content, .. } => MicroLogEntry {
            role: "assistant".into(),
            summary: first_line_or(&content.as_text(), 80),
        },
        Message::FunctionCall { name, .. } => MicroLogEntry {
            role: "assistant".into(),
            summary: format!("Called {name}()"),
        },
        Message::FunctionCallOutput { name, output, .. } => MicroLogEntry {
            role: "tool".into(),
            summary: format!("{name}: {}", first_line_or(output, 80)),
        },
    }
}

fn first_line_or(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or("");
    if line.len() <= max {
        line.to_string()
    } else {
        let mut cut = max;
        while !line.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &line[..cut])
    }
}

fn serialize_messages(messages: &[Message], which: &HashSet<usize>) -> String {
    messages
        .iter()
        .enumerate()
        .filter(|(i, _)| which.contains(i))
        .map(|(_, m)| match m {
            Message::Chat { role, content, .. } => {
                format!("{role:?}: {}", content.as_text())
            }
            Message::Assistant { content, .. } => format!("Assistant: {}", content.as_text()),
            Message::FunctionCall {
                name, arguments, ..
            } => format!("[tool_call: {name}({arguments})]"),
            Message::FunctionCallOutput { name, output, .. } => {
                format!("[tool_result {name}: {output}]")
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Deterministic summary used when no summarizer is configured or it fails:
/// one digest line per compacted message.
fn fallback_summary(messages: &[Message], which: &HashSet<usize>) -> String {
    messages
        .iter()
        .enumerate()
        .filter(|(i, _)| which.contains(i))
        .map(|(_, m)| {
            let e = micro_log_entry(m);
            format!("- {}: {}", e.role, e.summary)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
