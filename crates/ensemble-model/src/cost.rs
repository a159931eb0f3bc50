// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Central usage and cost ledger.
//!
//! Every provider call lands here as a [`UsageRecord`].  Cost is computed
//! deterministically from the catalog price table unless the adapter already
//! supplied it.  Observers are notified synchronously on every record;
//! observer panics are contained and logged, never propagated.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::catalog::{self, ModelCost};

/// Free-form metadata attached to a usage record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UsageMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// True when token counts were estimated rather than provider-reported.
    pub estimated: bool,
}

/// One immutable ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_count: Option<u32>,
    #[serde(default)]
    pub metadata: UsageMetadata,
    /// USD.  Derived from the price table, or passed through from the adapter.
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// The caller-supplied portion of a usage record; missing fields are filled
/// by [`CostTracker::add_usage`].
#[derive(Debug, Clone, Default)]
pub struct UsagePartial {
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: Option<u64>,
    pub image_count: Option<u32>,
    pub request_id: Option<String>,
    /// When set, used verbatim instead of the price table.
    pub cost: Option<f64>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Per-model aggregate returned by [`CostTracker::per_model`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelUsage {
    pub calls: u64,
    pub cost: f64,
}

/// Handle for unsubscribing an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverToken(u64);

type Observer = Arc<dyn Fn(&UsageRecord) + Send + Sync>;

#[derive(Default)]
struct Ledger {
    records: Vec<UsageRecord>,
    /// Cumulative (input + output) tokens per model since tracker creation.
    /// Drives tiered price bucket selection.
    cumulative_tokens: HashMap<String, u64>,
}

/// Process-wide usage/cost ledger with observer notification.
///
/// Owned by the runtime handle and passed explicitly; tests build fresh
/// trackers instead of resetting shared state.
#[derive(Default)]
pub struct CostTracker {
    ledger: Mutex<Ledger>,
    observers: Mutex<Vec<(u64, Observer)>>,
    next_token: Mutex<u64>,
}

impl CostTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill in missing fields, compute cost, append, and notify observers.
    pub fn add_usage(&self, partial: UsagePartial) -> UsageRecord {
        let timestamp = partial.timestamp.unwrap_or_else(Utc::now);
        let cost = match partial.cost {
            Some(c) => c,
            None => {
                let cumulative = {
                    let ledger = self.ledger.lock();
                    ledger
                        .cumulative_tokens
                        .get(&partial.model)
                        .copied()
                        .unwrap_or(0)
                };
                compute_cost(
                    &partial.model,
                    partial.input_tokens,
                    partial.output_tokens,
                    partial.cached_tokens,
                    partial.image_count,
                    cumulative,
                    &timestamp,
                )
            }
        };

        let record = UsageRecord {
            model: partial.model,
            input_tokens: partial.input_tokens,
            output_tokens: partial.output_tokens,
            cached_tokens: partial.cached_tokens,
            image_count: partial.image_count,
            metadata: UsageMetadata {
                request_id: partial.request_id,
                estimated: false,
            },
            cost,
            timestamp,
        };

        self.append_and_notify(record)
    }

    /// Record a call whose token counts must be estimated from text lengths
    /// (`ceil(len / 4)`).  The record is marked `metadata.estimated`.
    pub fn add_estimated_usage(
        &self,
        model: &str,
        input_text: &str,
        output_text: &str,
        request_id: Option<String>,
    ) -> UsageRecord {
        let input_tokens = input_text.len().div_ceil(4) as u64;
        let output_tokens = output_text.len().div_ceil(4) as u64;
        let timestamp = Utc::now();
        let cumulative = {
            let ledger = self.ledger.lock();
            ledger.cumulative_tokens.get(model).copied().unwrap_or(0)
        };
        let cost = compute_cost(
            model,
            input_tokens,
            output_tokens,
            None,
            None,
            cumulative,
            &timestamp,
        );
        let record = UsageRecord {
            model: model.to_string(),
            input_tokens,
            output_tokens,
            cached_tokens: None,
            image_count: None,
            metadata: UsageMetadata {
                request_id,
                estimated: true,
            },
            cost,
            timestamp,
        };
        self.append_and_notify(record)
    }

    fn append_and_notify(&self, record: UsageRecord) -> UsageRecord {
        {
            let mut ledger = self.ledger.lock();
            *ledger
                .cumulative_tokens
                .entry(record.model.clone())
                .or_insert(0) += record.input_tokens + record.output_tokens;
            ledger.records.push(record.clone());
        }
        let observers: Vec<Observer> = {
            let obs = self.observers.lock();
            obs.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for cb in observers {
            if catch_unwind(AssertUnwindSafe(|| cb(&record))).is_err() {
                warn!(model = %record.model, "cost observer panicked; ignoring");
            }
        }
        record
    }

    /// Subscribe to usage records.  Returns a token for `off_add_usage`.
    pub fn on_add_usage(&self, cb: impl Fn(&UsageRecord) + Send + Sync + 'static) -> ObserverToken {
        let mut next = self.next_token.lock();
        let token = *next;
        *next += 1;
        self.observers.lock().push((token, Arc::new(cb)));
        ObserverToken(token)
    }

    /// Remove a previously registered observer.  Unknown tokens are a no-op.
    pub fn off_add_usage(&self, token: ObserverToken) {
        self.observers.lock().retain(|(t, _)| *t != token.0);
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    pub fn total_cost(&self) -> f64 {
        self.ledger.lock().records.iter().map(|r| r.cost).sum()
    }

    pub fn record_count(&self) -> usize {
        self.ledger.lock().records.len()
    }

    /// Per-model call counts and cost.
    pub fn per_model(&self) -> HashMap<String, ModelUsage> {
        let ledger = self.ledger.lock();
        let mut out: HashMap<String, ModelUsage> = HashMap::new();
        for r in &ledger.records {
            let e = out.entry(r.model.clone()).or_default();
            e.calls += 1;
            e.cost += r.cost;
        }
        out
    }

    /// Human-readable ledger summary, one line per model plus a total.
    pub fn summary(&self) -> String {
        let per_model = self.per_model();
        let mut models: Vec<_> = per_model.iter().collect();
        models.sort_by(|a, b| a.0.cmp(b.0));
        let mut out = String::from("Cost summary:\n");
        for (model, usage) in models {
            out.push_str(&format!(
                "  {model}: {} calls, ${:.6}\n",
                usage.calls, usage.cost
            ));
        }
        out.push_str(&format!("  total: ${:.6}", self.total_cost()));
        out
    }

    /// Drop all records and cumulative counters.  Observers stay registered.
    pub fn reset(&self) {
        let mut ledger = self.ledger.lock();
        ledger.records.clear();
        ledger.cumulative_tokens.clear();
    }
}

/// Deterministic cost for one call at a fixed wall-clock instant.
///
/// Rate resolution order: a wall-clock window covering `timestamp`, then the
/// tier bucket for `cumulative_tokens`, then the flat rates.  Cached tokens
/// use the cached rate when the table has one; unknown models cost zero.
pub fn compute_cost(
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    cached_tokens: Option<u64>,
    image_count: Option<u32>,
    cumulative_tokens: u64,
    timestamp: &DateTime<Utc>,
) -> f64 {
    let Some(entry) = catalog::lookup(model) else {
        warn!(model, "no price table for model; recording zero cost");
        return 0.0;
    };
    let cost = &entry.cost;
    let (input_rate, output_rate) = resolve_rates(cost, cumulative_tokens, timestamp);

    let cached = cached_tokens.unwrap_or(0).min(input_tokens);
    let uncached = input_tokens - cached;

    let input_cost = match cost.cached_input_per_million {
        Some(cached_rate) => {
            (uncached as f64) * input_rate / 1_000_000.0
                + (cached as f64) * cached_rate / 1_000_000.0
        }
        None => (input_tokens as f64) * input_rate / 1_000_000.0,
    };
    let output_cost = (output_tokens as f64) * output_rate / 1_000_000.0;
    let image_cost = match (cost.per_image, image_count) {
        (Some(per_image), Some(n)) => per_image * n as f64,
        _ => 0.0,
    };

    input_cost + output_cost + image_cost
}

fn resolve_rates(cost: &ModelCost, cumulative_tokens: u64, timestamp: &DateTime<Utc>) -> (f64, f64) {
    if let Some(windows) = &cost.windows {
        let hour = timestamp.hour() as u8;
        if let Some(w) = windows.iter().find(|w| w.covers(hour)) {
            return (w.input_per_million, w.output_per_million);
        }
    }
    if let Some(tiers) = &cost.tiers {
        for t in tiers {
            match t.up_to_tokens {
                Some(limit) if cumulative_tokens >= limit => continue,
                _ => return (t.input_per_million, t.output_per_million),
            }
        }
    }
    (cost.input_per_million, cost.output_per_million)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at_hour(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, hour, 0, 0).unwrap()
    }

    // ── compute_cost ──────────────────────────────────────────────────────────

    #[test]
    fn flat_cost_is_tokens_times_rate() {
        // gpt-4o: $2.50 in, $10.00 out per million
        let c = compute_cost("gpt-4o", 1_000_000, 1_000_000, None, None, 0, &at_hour(8));
        assert!((c - 12.50).abs() < 1e-9);
    }

    #[test]
    fn cached_tokens_use_cached_rate() {
        // 1M input, half cached at $1.25: 0.5*2.50 + 0.5*1.25 = 1.875
        let c = compute_cost(
            "gpt-4o",
            1_000_000,
            0,
            Some(500_000),
            None,
            0,
            &at_hour(8),
        );
        assert!((c - 1.875).abs() < 1e-9);
    }

    #[test]
    fn window_rate_applies_inside_window() {
        // deepseek-chat off-peak (16:00–00:00 UTC): $0.14 / $0.21
        let c = compute_cost(
            "deepseek-chat",
            1_000_000,
            1_000_000,
            None,
            None,
            0,
            &at_hour(20),
        );
        assert!((c - 0.35).abs() < 1e-9);
    }

    #[test]
    fn standard_rate_applies_outside_window() {
        let c = compute_cost(
            "deepseek-chat",
            1_000_000,
            1_000_000,
            None,
            None,
            0,
            &at_hour(8),
        );
        assert!((c - 0.70).abs() < 1e-9);
    }

    #[test]
    fn tier_bucket_selected_by_cumulative_tokens() {
        // grok-4-mini: first 10M tokens at 0.30/0.50, then 0.20/0.35
        let early = compute_cost("grok-4-mini", 1_000_000, 0, None, None, 0, &at_hour(8));
        assert!((early - 0.30).abs() < 1e-9);
        let late = compute_cost(
            "grok-4-mini",
            1_000_000,
            0,
            None,
            None,
            20_000_000,
            &at_hour(8),
        );
        assert!((late - 0.20).abs() < 1e-9);
    }

    #[test]
    fn per_image_price_is_added() {
        let with_images =
            compute_cost("gpt-4o", 1000, 0, None, Some(2), 0, &at_hour(8));
        let without = compute_cost("gpt-4o", 1000, 0, None, None, 0, &at_hour(8));
        assert!((with_images - without - 2.0 * 0.003613).abs() < 1e-9);
    }

    #[test]
    fn unknown_model_costs_zero() {
        assert_eq!(
            compute_cost("no-such-model", 1000, 1000, None, None, 0, &at_hour(8)),
            0.0
        );
    }

    #[test]
    fn cost_is_deterministic_at_fixed_clock() {
        let ts = at_hour(9);
        let a = compute_cost("claude-sonnet-4-5", 1234, 567, Some(100), None, 0, &ts);
        let b = compute_cost("claude-sonnet-4-5", 1234, 567, Some(100), None, 0, &ts);
        assert_eq!(a, b);
        assert!(a >= 0.0);
    }

    // ── CostTracker ledger ────────────────────────────────────────────────────

    #[test]
    fn add_usage_computes_cost_from_table() {
        let tracker = CostTracker::new();
        let rec = tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            input_tokens: 1_000_000,
            output_tokens: 0,
            ..Default::default()
        });
        assert!((rec.cost - 2.50).abs() < 1e-9);
        assert!(!rec.metadata.estimated);
    }

    #[test]
    fn add_usage_passes_adapter_cost_through() {
        let tracker = CostTracker::new();
        let rec = tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            input_tokens: 10,
            output_tokens: 10,
            cost: Some(0.123),
            ..Default::default()
        });
        assert_eq!(rec.cost, 0.123);
    }

    #[test]
    fn estimated_usage_marks_metadata_and_divides_by_four() {
        let tracker = CostTracker::new();
        let rec = tracker.add_estimated_usage("gpt-4o", "12345678", "abcd", None);
        assert!(rec.metadata.estimated);
        assert_eq!(rec.input_tokens, 2);
        assert_eq!(rec.output_tokens, 1);
    }

    #[test]
    fn total_cost_sums_records() {
        let tracker = CostTracker::new();
        for _ in 0..3 {
            tracker.add_usage(UsagePartial {
                model: "gpt-4o".into(),
                input_tokens: 1_000_000,
                output_tokens: 0,
                ..Default::default()
            });
        }
        assert!((tracker.total_cost() - 7.50).abs() < 1e-9);
    }

    #[test]
    fn per_model_counts_calls() {
        let tracker = CostTracker::new();
        tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            ..Default::default()
        });
        tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            ..Default::default()
        });
        tracker.add_usage(UsagePartial {
            model: "claude-sonnet-4-5".into(),
            ..Default::default()
        });
        let per = tracker.per_model();
        assert_eq!(per["gpt-4o"].calls, 2);
        assert_eq!(per["claude-sonnet-4-5"].calls, 1);
    }

    #[test]
    fn summary_mentions_models_and_total() {
        let tracker = CostTracker::new();
        tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            ..Default::default()
        });
        let s = tracker.summary();
        assert!(s.contains("gpt-4o"));
        assert!(s.contains("total"));
    }

    #[test]
    fn reset_clears_ledger() {
        let tracker = CostTracker::new();
        tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            input_tokens: 100,
            ..Default::default()
        });
        tracker.reset();
        assert_eq!(tracker.record_count(), 0);
        assert_eq!(tracker.total_cost(), 0.0);
    }

    #[test]
    fn cumulative_tokens_advance_tier_selection() {
        let tracker = CostTracker::new();
        // Burn through the first tier.
        tracker.add_usage(UsagePartial {
            model: "grok-4-mini".into(),
            input_tokens: 10_000_000,
            output_tokens: 0,
            ..Default::default()
        });
        // Next call lands in the cheaper bucket.
        let rec = tracker.add_usage(UsagePartial {
            model: "grok-4-mini".into(),
            input_tokens: 1_000_000,
            output_tokens: 0,
            ..Default::default()
        });
        assert!((rec.cost - 0.20).abs() < 1e-9);
    }

    // ── Observers ─────────────────────────────────────────────────────────────

    #[test]
    fn observers_fire_synchronously() {
        let tracker = CostTracker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        tracker.on_add_usage(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            ..Default::default()
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_add_usage_unsubscribes() {
        let tracker = CostTracker::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let token = tracker.on_add_usage(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        tracker.off_add_usage(token);
        tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            ..Default::default()
        });
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeated_subscribe_unsubscribe_does_not_grow() {
        let tracker = CostTracker::new();
        for _ in 0..100 {
            let token = tracker.on_add_usage(|_| {});
            tracker.off_add_usage(token);
        }
        assert_eq!(tracker.observer_count(), 0);
    }

    #[test]
    fn panicking_observer_does_not_poison_the_ledger() {
        let tracker = CostTracker::new();
        tracker.on_add_usage(|_| panic!("observer bug"));
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        tracker.on_add_usage(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let rec = tracker.add_usage(UsagePartial {
            model: "gpt-4o".into(),
            ..Default::default()
        });
        // The record landed and the second observer still fired.
        assert_eq!(tracker.record_count(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(rec.cost >= 0.0);
    }
}
