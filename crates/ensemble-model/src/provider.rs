// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use ensemble_config::ModelSettings;

use crate::{cost::CostTracker, error::ProviderError, events::Event, types::Message};

/// A stream of canonical events produced by a provider adapter.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, ProviderError>> + Send>>;

/// A streamed transcription fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptionEvent {
    pub text: String,
    pub is_final: bool,
}

pub type TranscriptionStream =
    Pin<Box<dyn Stream<Item = Result<TranscriptionEvent, ProviderError>> + Send>>;

/// Schema-only view of a tool, as sent to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Per-request options handed to [`ProviderAdapter::open_stream`].
#[derive(Clone, Default)]
pub struct StreamOptions {
    pub settings: ModelSettings,
    pub tools: Vec<ToolSchema>,
    pub request_id: Option<String>,
    /// Ledger the adapter must report usage into.  When the wire carries no
    /// usage data the adapter estimates it via
    /// [`CostTracker::add_estimated_usage`].
    pub cost: Option<Arc<CostTracker>>,
}

/// Options for embedding calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbedOptions {
    /// Requested vector dimensionality; forwarded verbatim to the provider.
    pub dimensions: Option<u32>,
}

/// Options for image generation.
#[derive(Debug, Clone, Default)]
pub struct ImageOptions {
    pub count: Option<u32>,
    pub size: Option<String>,
}

/// Options for voice synthesis.
#[derive(Debug, Clone, Default)]
pub struct VoiceOptions {
    pub voice: Option<String>,
    pub format: Option<String>,
}

/// Options for audio transcription.
#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    pub language: Option<String>,
}

/// A provider backend, adapted to the canonical event taxonomy.
///
/// Adapters expose a subset of the operations; the default implementations
/// return [`ProviderError::Unsupported`] so callers can probe cheaply.
/// Every adapter must report usage for completed calls into
/// `StreamOptions::cost` with at least model and token counts, estimating
/// when the wire omits them.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider id (matches the provider registry).
    fn name(&self) -> &str;

    /// Open a streaming completion for `model` over `messages`.
    async fn open_stream(
        &self,
        messages: &[Message],
        model: &str,
        opts: &StreamOptions,
    ) -> Result<EventStream, ProviderError>;

    async fn create_embedding(
        &self,
        _text: &str,
        _model: &str,
        _opts: &EmbedOptions,
    ) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Unsupported("embeddings"))
    }

    /// Generate images; returns URLs or base64 payloads.
    async fn create_image(
        &self,
        _prompt: &str,
        _model: &str,
        _opts: &ImageOptions,
    ) -> Result<Vec<String>, ProviderError> {
        Err(ProviderError::Unsupported("image generation"))
    }

    /// Synthesise speech; returns encoded audio bytes.
    async fn create_voice(
        &self,
        _text: &str,
        _model: &str,
        _opts: &VoiceOptions,
    ) -> Result<Vec<u8>, ProviderError> {
        Err(ProviderError::Unsupported("voice synthesis"))
    }

    async fn create_transcription(
        &self,
        _audio: Vec<u8>,
        _model: &str,
        _opts: &TranscribeOptions,
    ) -> Result<TranscriptionStream, ProviderError> {
        Err(ProviderError::Unsupported("transcription"))
    }
}

/// External summarization collaborator used by history compaction and long
/// tool-result handling.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a dense summary of `text`.  `context` describes what the text
    /// is so the summarizer can prioritise (e.g. "conversation history",
    /// "output of tool read_file").
    async fn summarize(&self, text: &str, context: &str) -> anyhow::Result<String>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct BareAdapter;

    #[async_trait]
    impl ProviderAdapter for BareAdapter {
        fn name(&self) -> &str {
            "bare"
        }
        async fn open_stream(
            &self,
            _messages: &[Message],
            _model: &str,
            _opts: &StreamOptions,
        ) -> Result<EventStream, ProviderError> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[tokio::test]
    async fn default_operations_report_unsupported() {
        let a = BareAdapter;
        let e = a
            .create_embedding("x", "m", &EmbedOptions::default())
            .await
            .unwrap_err();
        assert_eq!(e.code(), "UNSUPPORTED");
        let e = a
            .create_image("x", "m", &ImageOptions::default())
            .await
            .unwrap_err();
        assert_eq!(e.code(), "UNSUPPORTED");
        let e = a
            .create_voice("x", "m", &VoiceOptions::default())
            .await
            .unwrap_err();
        assert_eq!(e.code(), "UNSUPPORTED");
    }

    #[test]
    fn embed_options_dimensions_pass_through() {
        let o = EmbedOptions {
            dimensions: Some(256),
        };
        assert_eq!(o.dimensions, Some(256));
    }
}
