// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model selection: class/score/disabled-aware weighted random pick.
//!
//! Candidate set = class members minus disabled models, filtered by
//! provider-key availability and remaining quota.  Classes marked `random`
//! pick by weighted random (per-agent score, else catalog score, else 50;
//! weight 0 excludes); other classes pick the first available member.
//! A directly pinned model skips selection after alias normalization.

use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::warn;

use crate::{
    catalog,
    error::ProviderError,
    quota::QuotaTracker,
    registry,
};

/// Default selection weight for models without an explicit score.
const DEFAULT_SCORE: u32 = 50;

/// The per-agent inputs to a selection decision.
#[derive(Debug, Clone, Default)]
pub struct SelectionRequest<'a> {
    /// Directly pinned model; skips class selection entirely.
    pub model: Option<&'a str>,
    pub model_class: Option<&'a str>,
    pub disabled_models: &'a [String],
    /// Per-agent weight overrides, keyed by canonical model id.
    pub model_scores: Option<&'a HashMap<String, u32>>,
}

type KeyCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub struct ModelSelector {
    quota: Arc<QuotaTracker>,
    /// Provider-id → credentials-present.  Swappable so tests do not depend
    /// on the process environment.
    key_check: KeyCheck,
}

impl ModelSelector {
    pub fn new(quota: Arc<QuotaTracker>) -> Self {
        Self {
            quota,
            key_check: Box::new(registry::provider_has_key),
        }
    }

    /// Replace the provider-key probe (tests).
    pub fn with_key_check(
        mut self,
        check: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.key_check = Box::new(check);
        self
    }

    /// Resolve a concrete model id for the request.
    pub fn select(&self, req: &SelectionRequest<'_>) -> Result<String, ProviderError> {
        self.select_with_rng(req, &mut rand::rng())
    }

    /// Like [`select`](Self::select) with a caller-supplied RNG so weighted
    /// picks are reproducible under test.
    pub fn select_with_rng(
        &self,
        req: &SelectionRequest<'_>,
        rng: &mut impl Rng,
    ) -> Result<String, ProviderError> {
        // A pinned model wins outright, after alias normalization.
        if let Some(model) = req.model {
            return Ok(catalog::canonical_id(model));
        }

        let class_name = req.model_class.ok_or_else(|| {
            ProviderError::Validation("agent pins neither a model nor a model class".into())
        })?;
        let class = catalog::class(class_name)
            .ok_or_else(|| ProviderError::ModelNotFound(format!("model class {class_name}")))?;
        if class.models.is_empty() {
            return Err(ProviderError::ModelNotFound(format!(
                "model class {class_name} is empty"
            )));
        }

        let disabled: Vec<String> = req
            .disabled_models
            .iter()
            .map(|m| catalog::canonical_id(m))
            .collect();
        let candidates: Vec<String> = class
            .models
            .iter()
            .filter(|m| !disabled.contains(m))
            .cloned()
            .collect();

        let available: Vec<String> = candidates
            .iter()
            .filter(|m| self.model_is_available(m))
            .cloned()
            .collect();

        if available.is_empty() {
            // All candidates filtered out: return any class member that at
            // least has credentials, else the first member outright.
            let fallback = class
                .models
                .iter()
                .find(|m| self.model_is_available(m))
                .or_else(|| class.models.iter().find(|m| self.provider_keyed(m)))
                .unwrap_or(&class.models[0])
                .clone();
            warn!(
                class = class_name,
                model = %fallback,
                "all class candidates filtered out; falling back ignoring filters"
            );
            return Ok(fallback);
        }

        if !class.random {
            return Ok(available[0].clone());
        }
        Ok(self.weighted_pick(&available, req.model_scores, rng))
    }

    fn provider_keyed(&self, model: &str) -> bool {
        catalog::lookup(model)
            .map(|e| (self.key_check)(&e.provider))
            .unwrap_or(false)
    }

    fn model_is_available(&self, model: &str) -> bool {
        self.provider_keyed(model) && self.quota.has_quota(model)
    }

    fn weighted_pick(
        &self,
        candidates: &[String],
        scores: Option<&HashMap<String, u32>>,
        rng: &mut impl Rng,
    ) -> String {
        let weight_of = |m: &str| -> u64 {
            scores
                .and_then(|s| s.get(m).copied())
                .or_else(|| catalog::lookup(m).and_then(|e| e.score))
                .unwrap_or(DEFAULT_SCORE) as u64
        };
        let weighted: Vec<(&String, u64)> = candidates
            .iter()
            .map(|m| (m, weight_of(m)))
            .filter(|(_, w)| *w > 0)
            .collect();
        if weighted.is_empty() {
            // Every candidate was zero-weighted; the agent disabled the class
            // in all but name.  Pick the first available rather than failing.
            warn!("all candidate weights are zero; using first available");
            return candidates[0].clone();
        }
        let total: u64 = weighted.iter().map(|(_, w)| w).sum();
        let mut roll = rng.random_range(0..total);
        for (m, w) in &weighted {
            if roll < *w {
                return (*m).clone();
            }
            roll -= w;
        }
        weighted[weighted.len() - 1].0.clone()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn selector_with_all_keys() -> ModelSelector {
        ModelSelector::new(Arc::new(QuotaTracker::new())).with_key_check(|_| true)
    }

    #[test]
    fn pinned_model_skips_selection() {
        let s = selector_with_all_keys();
        let req = SelectionRequest {
            model: Some("gpt-4o"),
            ..Default::default()
        };
        assert_eq!(s.select(&req).unwrap(), "gpt-4o");
    }

    #[test]
    fn pinned_alias_is_normalized() {
        let s = selector_with_all_keys();
        let req = SelectionRequest {
            model: Some("deepseek-v3"),
            ..Default::default()
        };
        assert_eq!(s.select(&req).unwrap(), "deepseek-chat");
    }

    #[test]
    fn missing_model_and_class_is_a_validation_error() {
        let s = selector_with_all_keys();
        let e = s.select(&SelectionRequest::default()).unwrap_err();
        assert_eq!(e.code(), "VALIDATION");
    }

    #[test]
    fn unknown_class_is_model_not_found() {
        let s = selector_with_all_keys();
        let req = SelectionRequest {
            model_class: Some("nope"),
            ..Default::default()
        };
        assert_eq!(s.select(&req).unwrap_err().code(), "MODEL_NOT_FOUND");
    }

    #[test]
    fn non_random_class_picks_first_available() {
        let s = selector_with_all_keys();
        let req = SelectionRequest {
            model_class: Some("vision"),
            ..Default::default()
        };
        // vision is ordered: gpt-4o first
        assert_eq!(s.select(&req).unwrap(), "gpt-4o");
    }

    #[test]
    fn disabled_models_are_excluded() {
        let s = selector_with_all_keys();
        let disabled = vec!["gpt-4o".to_string()];
        let req = SelectionRequest {
            model_class: Some("vision"),
            disabled_models: &disabled,
            ..Default::default()
        };
        assert_eq!(s.select(&req).unwrap(), "gemini-3-pro");
    }

    #[test]
    fn key_filter_drops_providers_without_credentials() {
        let s = ModelSelector::new(Arc::new(QuotaTracker::new()))
            .with_key_check(|provider| provider == "google");
        let req = SelectionRequest {
            model_class: Some("vision"),
            ..Default::default()
        };
        assert_eq!(s.select(&req).unwrap(), "gemini-3-pro");
    }

    #[test]
    fn quota_filter_drops_exhausted_models() {
        let quota = Arc::new(QuotaTracker::new());
        quota.set_limits(
            "gpt-4o",
            crate::quota::QuotaLimits {
                max_requests_per_day: Some(1),
                ..Default::default()
            },
        );
        quota.record_usage("gpt-4o", 10, 0.0);
        let s = ModelSelector::new(quota).with_key_check(|_| true);
        let req = SelectionRequest {
            model_class: Some("vision"),
            ..Default::default()
        };
        assert_eq!(s.select(&req).unwrap(), "gemini-3-pro");
    }

    #[test]
    fn weighted_pick_honours_zero_weight_exclusion() {
        let s = selector_with_all_keys();
        let mut scores = HashMap::new();
        // Zero out everything except one model.
        for m in catalog::class("standard").unwrap().models {
            scores.insert(m, 0);
        }
        scores.insert("grok-4".to_string(), 10);
        let req = SelectionRequest {
            model_class: Some("standard"),
            model_scores: Some(&scores),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(s.select_with_rng(&req, &mut rng).unwrap(), "grok-4");
        }
    }

    #[test]
    fn weighted_pick_distribution_tracks_scores() {
        let s = selector_with_all_keys();
        let mut scores = HashMap::new();
        for m in catalog::class("standard").unwrap().models {
            scores.insert(m, 0);
        }
        scores.insert("gpt-4o".to_string(), 90);
        scores.insert("deepseek-chat".to_string(), 10);
        let req = SelectionRequest {
            model_class: Some("standard"),
            model_scores: Some(&scores),
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(42);
        let mut gpt = 0;
        for _ in 0..200 {
            if s.select_with_rng(&req, &mut rng).unwrap() == "gpt-4o" {
                gpt += 1;
            }
        }
        // Expect roughly 90%; wide tolerance keeps the seed-dependence low.
        assert!(gpt > 150, "gpt-4o picked only {gpt}/200 times");
    }

    #[test]
    fn fallback_ignores_filters_when_everything_is_excluded() {
        let quota = Arc::new(QuotaTracker::new());
        for m in catalog::class("vision").unwrap().models {
            quota.set_limits(
                m.clone(),
                crate::quota::QuotaLimits {
                    max_requests_per_day: Some(0),
                    ..Default::default()
                },
            );
            quota.record_usage(&m, 1, 0.0);
        }
        let s = ModelSelector::new(quota).with_key_check(|_| true);
        let req = SelectionRequest {
            model_class: Some("vision"),
            ..Default::default()
        };
        // Everything is quota-exhausted, but selection still yields a model.
        let picked = s.select(&req).unwrap();
        assert!(catalog::class("vision").unwrap().models.contains(&picked));
    }
}
