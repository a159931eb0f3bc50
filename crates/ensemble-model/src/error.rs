// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed failure taxonomy for provider adapters and the orchestrator.
//!
//! Every error carries a stable code string so callers can dispatch without
//! string-matching the display text.  `classify` maps raw HTTP status codes
//! and message shapes from any adapter into this taxonomy.

use serde::{Deserialize, Serialize};

/// Which resource a quota failure exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaKind {
    Tokens,
    Requests,
    Cost,
}

impl std::fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tokens => write!(f, "tokens"),
            Self::Requests => write!(f, "requests"),
            Self::Cost => write!(f, "cost"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Generic upstream failure that fits no narrower kind.
    #[error("provider error: {0}")]
    Provider(String),

    /// The provider throttled us.  Retryable.
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after_seconds: Option<u64>,
    },

    /// A hard quota was exhausted.  Not retryable.
    #[error("quota exhausted ({kind}): {message}")]
    Quota { message: String, kind: QuotaKind },

    /// Invalid or missing credentials.  Not retryable.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The requested model does not exist for any configured provider.
    #[error("model not found: {0}")]
    ModelNotFound(String),

    /// No provider adapter is registered for the model's provider id.
    #[error("no provider available for: {0}")]
    NoProvider(String),

    /// Caller-side malformed input.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The stream was cut mid-flight.  Retryable with resume-from-scratch.
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("image processing failed: {0}")]
    ImageProcessing(String),

    /// A tool function failed.  Surfaced to the caller; never aborts the
    /// round loop.
    #[error("tool execution failed: {0}")]
    ToolExecution(String),

    /// The adapter does not implement this operation.
    #[error("operation not supported by this provider: {0}")]
    Unsupported(&'static str),
}

impl ProviderError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::RateLimit { .. } => "RATE_LIMIT",
            Self::Quota { .. } => "QUOTA_EXCEEDED",
            Self::Authentication(_) => "AUTHENTICATION",
            Self::ModelNotFound(_) => "MODEL_NOT_FOUND",
            Self::NoProvider(_) => "NO_PROVIDER",
            Self::Validation(_) => "VALIDATION",
            Self::StreamInterrupted(_) => "STREAM_INTERRUPTED",
            Self::ImageProcessing(_) => "IMAGE_PROCESSING",
            Self::ToolExecution(_) => "TOOL_EXECUTION",
            Self::Unsupported(_) => "UNSUPPORTED",
        }
    }

    /// Whether the orchestrator may retry the request from scratch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit { .. } | Self::StreamInterrupted(_))
    }

    /// Provider-suggested wait before retrying, when it sent one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimit {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Classify a raw adapter failure by status code and message shape.
    ///
    /// The rules are ordered: status codes win over message matching, and
    /// the more specific message patterns win over the generic fallback.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        match status {
            Some(429) => Self::RateLimit {
                message: message.to_string(),
                retry_after_seconds: extract_retry_after(&lower),
            },
            Some(401) | Some(403) => Self::Authentication(message.to_string()),
            Some(404) if lower.contains("model") => Self::ModelNotFound(message.to_string()),
            Some(s) if s >= 500 => Self::StreamInterrupted(message.to_string()),
            _ => {
                if lower.contains("rate limit") {
                    Self::RateLimit {
                        message: message.to_string(),
                        retry_after_seconds: extract_retry_after(&lower),
                    }
                } else if lower.contains("quota") {
                    Self::Quota {
                        message: message.to_string(),
                        kind: QuotaKind::Tokens,
                    }
                } else if lower.contains("api key") || lower.contains("unauthorized") {
                    Self::Authentication(message.to_string())
                } else {
                    Self::Provider(message.to_string())
                }
            }
        }
    }
}

/// Best-effort scrape of a `retry after N` hint from an error body.
fn extract_retry_after(lower: &str) -> Option<u64> {
    let idx = lower.find("retry after")?;
    lower[idx + "retry after".len()..]
        .split_whitespace()
        .next()
        .and_then(|tok| tok.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_retryable() {
        let e = ProviderError::RateLimit {
            message: "slow down".into(),
            retry_after_seconds: Some(2),
        };
        assert!(e.is_retryable());
        assert_eq!(e.retry_after(), Some(2));
    }

    #[test]
    fn stream_interrupted_is_retryable() {
        assert!(ProviderError::StreamInterrupted("cut".into()).is_retryable());
    }

    #[test]
    fn authentication_and_quota_are_not_retryable() {
        assert!(!ProviderError::Authentication("bad key".into()).is_retryable());
        let q = ProviderError::Quota {
            message: "out".into(),
            kind: QuotaKind::Cost,
        };
        assert!(!q.is_retryable());
    }

    #[test]
    fn classify_429_is_rate_limit() {
        let e = ProviderError::classify(Some(429), "Too Many Requests");
        assert_eq!(e.code(), "RATE_LIMIT");
    }

    #[test]
    fn classify_401_is_authentication() {
        assert_eq!(
            ProviderError::classify(Some(401), "nope").code(),
            "AUTHENTICATION"
        );
        assert_eq!(
            ProviderError::classify(Some(403), "nope").code(),
            "AUTHENTICATION"
        );
    }

    #[test]
    fn classify_message_shapes_without_status() {
        assert_eq!(
            ProviderError::classify(None, "Rate limit reached for gpt-4o").code(),
            "RATE_LIMIT"
        );
        assert_eq!(
            ProviderError::classify(None, "You exceeded your current quota").code(),
            "QUOTA_EXCEEDED"
        );
        assert_eq!(
            ProviderError::classify(None, "Incorrect API key provided").code(),
            "AUTHENTICATION"
        );
        assert_eq!(
            ProviderError::classify(None, "something odd").code(),
            "PROVIDER_ERROR"
        );
    }

    #[test]
    fn classify_5xx_is_stream_interrupted() {
        assert_eq!(
            ProviderError::classify(Some(502), "bad gateway").code(),
            "STREAM_INTERRUPTED"
        );
    }

    #[test]
    fn classify_404_with_model_is_model_not_found() {
        assert_eq!(
            ProviderError::classify(Some(404), "The model `gpt-9` does not exist").code(),
            "MODEL_NOT_FOUND"
        );
    }

    #[test]
    fn retry_after_hint_is_extracted() {
        let e = ProviderError::classify(None, "rate limit: please retry after 7 seconds");
        assert_eq!(e.retry_after(), Some(7));
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ProviderError::Validation("x".into()).code(), "VALIDATION");
        assert_eq!(
            ProviderError::NoProvider("x".into()).code(),
            "NO_PROVIDER"
        );
        assert_eq!(
            ProviderError::ToolExecution("x".into()).code(),
            "TOOL_EXECUTION"
        );
    }
}
