// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-model daily quota enforcement.
//!
//! An in-memory, lock-protected store that records daily usage per model and
//! checks it against optional limits.  Counters auto-reset when the UTC date
//! rolls over.  The model selector consults [`QuotaTracker::has_quota`] to
//! drop exhausted models from the candidate set.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::QuotaKind;

/// Optional per-model daily ceilings.  `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    pub max_tokens_per_day: Option<u64>,
    pub max_requests_per_day: Option<u64>,
    pub max_cost_per_day: Option<f64>,
}

/// Running counters for a single model on a single day.
#[derive(Debug, Clone)]
struct DailyUsage {
    date: NaiveDate,
    tokens: u64,
    requests: u64,
    cost: f64,
}

/// Snapshot of one model's usage against its limits.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub model: String,
    pub date: String,
    pub tokens_used: u64,
    pub requests_used: u64,
    pub cost_used: f64,
}

/// In-memory daily quota tracker.
#[derive(Default)]
pub struct QuotaTracker {
    limits: RwLock<HashMap<String, QuotaLimits>>,
    usage: RwLock<HashMap<String, DailyUsage>>,
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the limits for one model.
    pub fn set_limits(&self, model: impl Into<String>, limits: QuotaLimits) {
        self.limits.write().insert(model.into(), limits);
    }

    /// Whether the model may serve another request today.
    pub fn has_quota(&self, model: &str) -> bool {
        self.exceeded_kind(model).is_none()
    }

    /// The first exhausted quota dimension, if any.
    pub fn exceeded_kind(&self, model: &str) -> Option<QuotaKind> {
        let limits = self.limits.read();
        let Some(limits) = limits.get(model) else {
            return None; // no limits configured = unlimited
        };
        let today = Utc::now().date_naive();
        let usage = self.usage.read();
        let entry = match usage.get(model) {
            Some(e) if e.date == today => e,
            _ => return None, // no usage today = within limits
        };
        if let Some(max) = limits.max_tokens_per_day {
            if entry.tokens >= max {
                return Some(QuotaKind::Tokens);
            }
        }
        if let Some(max) = limits.max_requests_per_day {
            if entry.requests >= max {
                return Some(QuotaKind::Requests);
            }
        }
        if let Some(max) = limits.max_cost_per_day {
            if entry.cost >= max {
                return Some(QuotaKind::Cost);
            }
        }
        None
    }

    /// Record usage for one completed request.  Counters reset automatically
    /// when the UTC date rolls over.
    pub fn record_usage(&self, model: &str, tokens: u64, cost: f64) {
        let today = Utc::now().date_naive();
        let mut usage = self.usage.write();
        let entry = usage.entry(model.to_string()).or_insert(DailyUsage {
            date: today,
            tokens: 0,
            requests: 0,
            cost: 0.0,
        });
        if entry.date != today {
            entry.date = today;
            entry.tokens = 0;
            entry.requests = 0;
            entry.cost = 0.0;
        }
        entry.tokens += tokens;
        entry.requests += 1;
        entry.cost += cost;
    }

    /// Current usage snapshot for one model, if it has any today.
    pub fn status(&self, model: &str) -> Option<QuotaStatus> {
        let usage = self.usage.read();
        usage.get(model).map(|e| QuotaStatus {
            model: model.to_string(),
            date: e.date.to_string(),
            tokens_used: e.tokens,
            requests_used: e.requests,
            cost_used: e.cost,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_model_has_quota() {
        let q = QuotaTracker::new();
        assert!(q.has_quota("gpt-4o"));
    }

    #[test]
    fn token_limit_exhausts_quota() {
        let q = QuotaTracker::new();
        q.set_limits(
            "gpt-4o",
            QuotaLimits {
                max_tokens_per_day: Some(100),
                ..Default::default()
            },
        );
        q.record_usage("gpt-4o", 50, 0.0);
        assert!(q.has_quota("gpt-4o"));
        q.record_usage("gpt-4o", 50, 0.0);
        assert!(!q.has_quota("gpt-4o"));
        assert_eq!(q.exceeded_kind("gpt-4o"), Some(QuotaKind::Tokens));
    }

    #[test]
    fn request_limit_exhausts_quota() {
        let q = QuotaTracker::new();
        q.set_limits(
            "m",
            QuotaLimits {
                max_requests_per_day: Some(2),
                ..Default::default()
            },
        );
        q.record_usage("m", 1, 0.0);
        q.record_usage("m", 1, 0.0);
        assert_eq!(q.exceeded_kind("m"), Some(QuotaKind::Requests));
    }

    #[test]
    fn cost_limit_exhausts_quota() {
        let q = QuotaTracker::new();
        q.set_limits(
            "m",
            QuotaLimits {
                max_cost_per_day: Some(1.0),
                ..Default::default()
            },
        );
        q.record_usage("m", 1, 2.0);
        assert_eq!(q.exceeded_kind("m"), Some(QuotaKind::Cost));
    }

    #[test]
    fn usage_on_other_models_does_not_affect_quota() {
        let q = QuotaTracker::new();
        q.set_limits(
            "a",
            QuotaLimits {
                max_requests_per_day: Some(1),
                ..Default::default()
            },
        );
        q.record_usage("b", 1_000_000, 99.0);
        assert!(q.has_quota("a"));
    }

    #[test]
    fn status_reports_accumulated_usage() {
        let q = QuotaTracker::new();
        q.record_usage("m", 10, 0.5);
        q.record_usage("m", 5, 0.25);
        let s = q.status("m").unwrap();
        assert_eq!(s.tokens_used, 15);
        assert_eq!(s.requests_used, 2);
        assert!((s.cost_used - 0.75).abs() < 1e-9);
    }
}
