// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata and pricing for known models.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capability flags for a model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelFeatures {
    /// Total context window in tokens.
    pub context_length: u32,
    pub supports_functions: bool,
    pub vision: bool,
}

/// A pricing tier selected by cumulative token volume.
///
/// Tiers are checked in order; the first whose `up_to_tokens` is `None` or
/// not yet exceeded applies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostTier {
    #[serde(default)]
    pub up_to_tokens: Option<u64>,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

/// A discounted wall-clock pricing window in UTC hours, end-exclusive.
/// `start_hour > end_hour` wraps past midnight.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostWindow {
    pub start_hour: u8,
    pub end_hour: u8,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl CostWindow {
    /// Whether `hour` (UTC, 0–23) falls inside this window.
    pub fn covers(&self, hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..self.end_hour).contains(&hour)
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

/// Cost table for one model, USD per million tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelCost {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cached_input_per_million: Option<f64>,
    /// Flat price per input image, when the provider bills images separately.
    pub per_image: Option<f64>,
    pub tiers: Option<Vec<CostTier>>,
    pub windows: Option<Vec<CostWindow>>,
}

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelEntry {
    /// Canonical model identifier (e.g. "gpt-4o", "claude-opus-4-6").
    pub id: String,
    /// Provider identifier from the provider registry.
    pub provider: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Class this model belongs to (selection group).
    pub class: String,
    #[serde(default)]
    pub features: ModelFeatures,
    #[serde(default)]
    pub cost: ModelCost,
    /// Default selection weight; classes may override per agent.
    #[serde(default)]
    pub score: Option<u32>,
}

/// A named group of models the selector chooses from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelClass {
    pub models: Vec<String>,
    /// When true the selector picks by weighted random; otherwise the first
    /// available model wins.
    #[serde(default)]
    pub random: bool,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelEntry>,
    classes: HashMap<String, ModelClass>,
}

fn parse_catalog() -> CatalogFile {
    let yaml = include_str!("../models.yaml");
    serde_yaml::from_str(yaml).expect("bundled models.yaml must be valid")
}

/// Return all entries from the bundled static catalog.
pub fn static_catalog() -> Vec<ModelEntry> {
    parse_catalog().models
}

/// Return all model classes from the bundled static catalog.
pub fn classes() -> HashMap<String, ModelClass> {
    parse_catalog().classes
}

/// Look up a model by canonical id or alias.
pub fn lookup(model: &str) -> Option<ModelEntry> {
    static_catalog()
        .into_iter()
        .find(|e| e.id == model || e.aliases.iter().any(|a| a == model))
}

/// Resolve an alias to the canonical model id.  Unknown names pass through
/// unchanged so external/custom models keep working.
pub fn canonical_id(model: &str) -> String {
    lookup(model).map(|e| e.id).unwrap_or_else(|| model.to_string())
}

/// Look up a class by name.
pub fn class(name: &str) -> Option<ModelClass> {
    classes().remove(name)
}

/// Context window for a model, with a fallback for unknown models.
pub fn context_length(model: &str, default: u32) -> u32 {
    lookup(model)
        .map(|e| e.features.context_length)
        .filter(|&c| c > 0)
        .unwrap_or(default)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_catalog_is_non_empty() {
        assert!(!static_catalog().is_empty());
    }

    #[test]
    fn gpt4o_is_in_catalog() {
        let e = lookup("gpt-4o").expect("gpt-4o must be in catalog");
        assert_eq!(e.provider, "openai");
        assert!(e.features.context_length >= 128_000);
        assert!(e.features.supports_functions);
    }

    #[test]
    fn alias_resolves_to_canonical_id() {
        assert_eq!(canonical_id("claude-opus-4-6-20260105"), "claude-opus-4-6");
        assert_eq!(canonical_id("deepseek-v3"), "deepseek-chat");
    }

    #[test]
    fn unknown_model_passes_through_canonicalisation() {
        assert_eq!(canonical_id("my-local-model"), "my-local-model");
    }

    #[test]
    fn standard_class_is_random() {
        let c = class("standard").expect("standard class must exist");
        assert!(c.random);
        assert!(c.models.contains(&"gpt-4o".to_string()));
    }

    #[test]
    fn every_class_member_exists_in_catalog() {
        for (name, c) in classes() {
            for m in &c.models {
                assert!(
                    lookup(m).is_some(),
                    "class {name} references unknown model {m}"
                );
            }
        }
    }

    #[test]
    fn every_model_names_a_known_class() {
        let classes = classes();
        for e in static_catalog() {
            assert!(
                classes.contains_key(&e.class),
                "{} names unknown class {}",
                e.id,
                e.class
            );
        }
    }

    #[test]
    fn deepseek_has_offpeak_window() {
        let e = lookup("deepseek-chat").unwrap();
        let windows = e.cost.windows.expect("deepseek must have pricing windows");
        assert!(!windows.is_empty());
        // Window wraps past midnight: 16:00 → 00:00 UTC.
        assert!(windows[0].covers(23));
        assert!(windows[0].covers(16));
        assert!(!windows[0].covers(8));
    }

    #[test]
    fn window_covers_non_wrapping_range() {
        let w = CostWindow {
            start_hour: 2,
            end_hour: 6,
            input_per_million: 1.0,
            output_per_million: 1.0,
        };
        assert!(w.covers(2));
        assert!(w.covers(5));
        assert!(!w.covers(6));
        assert!(!w.covers(1));
    }

    #[test]
    fn tiered_model_parses_open_ended_last_tier() {
        let e = lookup("grok-4-mini").unwrap();
        let tiers = e.cost.tiers.expect("grok-4-mini must have tiers");
        assert_eq!(tiers.len(), 2);
        assert!(tiers[0].up_to_tokens.is_some());
        assert!(tiers[1].up_to_tokens.is_none());
    }

    #[test]
    fn context_length_fallback_used_when_unknown() {
        assert_eq!(context_length("no-such-model", 4096), 4096);
    }

    #[test]
    fn voice_model_with_zero_window_falls_back() {
        // eleven-v3 has context_length 0 (non-token model); callers get the
        // fallback instead of a zero budget.
        assert_eq!(context_length("eleven-v3", 4096), 4096);
    }
}
