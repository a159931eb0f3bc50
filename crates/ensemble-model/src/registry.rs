// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Provider registry: static metadata for every supported backend.
//!
//! This module is the single source of truth for which provider ids exist
//! and where their credentials come from.  Adapter construction lives with
//! the adapters themselves.

/// Metadata describing a registered provider backend.
#[derive(Debug, Clone)]
pub struct ProviderMeta {
    /// Unique provider id referenced by catalog entries (e.g. `"openai"`).
    pub id: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
    /// Environment variable that holds the API key.  `None` for providers
    /// that need no key (the test provider).
    pub api_key_env: Option<&'static str>,
    /// Default API base URL, when the provider speaks an HTTP API.
    pub default_base_url: Option<&'static str>,
}

/// Complete registry of supported providers.
pub static PROVIDERS: &[ProviderMeta] = &[
    ProviderMeta {
        id: "openai",
        name: "OpenAI",
        api_key_env: Some("OPENAI_API_KEY"),
        default_base_url: Some("https://api.openai.com/v1"),
    },
    ProviderMeta {
        id: "anthropic",
        name: "Anthropic",
        api_key_env: Some("ANTHROPIC_API_KEY"),
        default_base_url: Some("https://api.anthropic.com"),
    },
    ProviderMeta {
        id: "google",
        name: "Google Gemini",
        api_key_env: Some("GOOGLE_API_KEY"),
        default_base_url: Some("https://generativelanguage.googleapis.com"),
    },
    ProviderMeta {
        id: "xai",
        name: "xAI",
        api_key_env: Some("XAI_API_KEY"),
        default_base_url: Some("https://api.x.ai/v1"),
    },
    ProviderMeta {
        id: "deepseek",
        name: "DeepSeek",
        api_key_env: Some("DEEPSEEK_API_KEY"),
        default_base_url: Some("https://api.deepseek.com/v1"),
    },
    ProviderMeta {
        id: "openrouter",
        name: "OpenRouter",
        api_key_env: Some("OPENROUTER_API_KEY"),
        default_base_url: Some("https://openrouter.ai/api/v1"),
    },
    ProviderMeta {
        id: "elevenlabs",
        name: "ElevenLabs",
        api_key_env: Some("ELEVENLABS_API_KEY"),
        default_base_url: Some("https://api.elevenlabs.io/v1"),
    },
    ProviderMeta {
        id: "test",
        name: "Test",
        api_key_env: None,
        default_base_url: None,
    },
];

/// Returns all registered providers in declaration order.
pub fn list_providers() -> &'static [ProviderMeta] {
    PROVIDERS
}

/// Look up a provider by id.  Returns `None` for unknown ids.
pub fn get_provider(id: &str) -> Option<&'static ProviderMeta> {
    PROVIDERS.iter().find(|p| p.id == id)
}

/// Whether the provider's credentials are present in the environment.
///
/// Providers without a key requirement are always available.  Unknown
/// provider ids report `false` so their models drop out of selection.
pub fn provider_has_key(id: &str) -> bool {
    match get_provider(id) {
        Some(meta) => match meta.api_key_env {
            Some(var) => std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false),
            None => true,
        },
        None => false,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
