// Cost accounting: per-model price table, per-provider usage accumulation,
// and daily/monthly budget gates. A request whose estimated cost would break
// a budget falls through to the next candidate.

use crate::config::AiConfig;
use chrono::{Datelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input: f64,
    pub output: f64,
}

/// Price lookup by model-name prefix. Unknown models assume a cheap tier so
/// budgeting stays conservative without blocking.
pub fn model_price(model: &str) -> ModelPrice {
    // Normalize: strip provider prefixes like "anthropic/"
    let m = model.split('/').next_back().unwrap_or(model);
    match m {
        s if s.starts_with("claude-haiku") || s.starts_with("claude-3-haiku") => {
            ModelPrice { input: 0.80, output: 4.00 }
        }
        s if s.starts_with("claude-sonnet") || s.starts_with("claude-3-5-sonnet") => {
            ModelPrice { input: 3.00, output: 15.00 }
        }
        s if s.starts_with("claude-opus") => ModelPrice { input: 15.00, output: 75.00 },
        s if s.starts_with("gemini") && s.contains("flash") => {
            ModelPrice { input: 0.15, output: 0.60 }
        }
        s if s.starts_with("gemini") => ModelPrice { input: 1.25, output: 10.00 },
        s if s.starts_with("gpt-4o-mini") || s.starts_with("gpt-4.1-mini") => {
            ModelPrice { input: 0.15, output: 0.60 }
        }
        s if s.starts_with("gpt-4") => ModelPrice { input: 2.50, output: 10.00 },
        s if s.starts_with("o3") || s.starts_with("o1") => {
            ModelPrice { input: 10.00, output: 40.00 }
        }
        // Fallback: assume cheap model
        _ => ModelPrice { input: 0.50, output: 2.00 },
    }
}

/// Estimate USD cost given token counts and model name.
pub fn estimate_cost_usd(model: &str, tokens_in: u64, tokens_out: u64) -> f64 {
    let price = model_price(model);
    (tokens_in as f64 * price.input + tokens_out as f64 * price.output) / 1_000_000.0
}

/// Pre-call estimate from content length: roughly four characters per input
/// token and a generation of comparable size.
pub fn estimate_request_cost(model: &str, content: &str) -> f64 {
    let tokens = (content.len() as u64 / 4).max(16);
    estimate_cost_usd(model, tokens, tokens)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderUsage {
    pub provider: String,
    pub requests: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub day_usd: f64,
    pub month_usd: f64,
}

#[derive(Default)]
struct UsageSlot {
    day_key: u32,
    month_key: u32,
    requests: u64,
    tokens_in: u64,
    tokens_out: u64,
    day_usd: f64,
    month_usd: f64,
}

pub struct BudgetTracker {
    daily_cap_usd: f64,
    monthly_cap_usd: f64,
    usage: Mutex<HashMap<String, UsageSlot>>,
}

fn day_key() -> u32 {
    let now = Utc::now();
    now.ordinal() + now.year() as u32 * 1000
}

fn month_key() -> u32 {
    let now = Utc::now();
    now.month() + now.year() as u32 * 100
}

impl BudgetTracker {
    pub fn new(config: &AiConfig) -> Self {
        BudgetTracker {
            daily_cap_usd: config.daily_budget_usd,
            monthly_cap_usd: config.monthly_budget_usd,
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// Whether `estimated_usd` more spend fits this provider's budgets.
    pub fn has_headroom(&self, provider: &str, estimated_usd: f64) -> bool {
        let mut usage = self.usage.lock();
        let slot = usage.entry(provider.to_string()).or_default();
        roll_windows(slot);
        slot.day_usd + estimated_usd <= self.daily_cap_usd
            && slot.month_usd + estimated_usd <= self.monthly_cap_usd
    }

    /// Fold a completed response into the provider's usage.
    pub fn record(&self, provider: &str, model: &str, tokens_in: u64, tokens_out: u64) {
        let cost = estimate_cost_usd(model, tokens_in, tokens_out);
        let mut usage = self.usage.lock();
        let slot = usage.entry(provider.to_string()).or_default();
        roll_windows(slot);
        slot.requests += 1;
        slot.tokens_in += tokens_in;
        slot.tokens_out += tokens_out;
        slot.day_usd += cost;
        slot.month_usd += cost;
    }

    pub fn usage_report(&self) -> Vec<ProviderUsage> {
        let mut usage = self.usage.lock();
        let mut report: Vec<ProviderUsage> = usage
            .iter_mut()
            .map(|(provider, slot)| {
                roll_windows(slot);
                ProviderUsage {
                    provider: provider.clone(),
                    requests: slot.requests,
                    tokens_in: slot.tokens_in,
                    tokens_out: slot.tokens_out,
                    day_usd: slot.day_usd,
                    month_usd: slot.month_usd,
                }
            })
            .collect();
        report.sort_by(|a, b| a.provider.cmp(&b.provider));
        report
    }
}

/// Reset counters whose calendar window rolled over.
fn roll_windows(slot: &mut UsageSlot) {
    let day = day_key();
    let month = month_key();
    if slot.day_key != day {
        slot.day_key = day;
        slot.day_usd = 0.0;
    }
    if slot.month_key != month {
        slot.month_key = month;
        slot.month_usd = 0.0;
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(daily: f64, monthly: f64) -> BudgetTracker {
        BudgetTracker::new(&AiConfig {
            daily_budget_usd: daily,
            monthly_budget_usd: monthly,
            ..Default::default()
        })
    }

    #[test]
    fn cost_estimate_scales_with_tokens() {
        let small = estimate_cost_usd("claude-sonnet-4", 1_000, 1_000);
        let large = estimate_cost_usd("claude-sonnet-4", 100_000, 100_000);
        assert!(large > small * 50.0);
        // 1k in + 1k out on a 3/15 model = 0.018 USD
        assert!((small - 0.018).abs() < 1e-9);
    }

    #[test]
    fn unknown_models_fall_back_to_cheap_tier() {
        assert_eq!(model_price("mystery-model"), ModelPrice { input: 0.50, output: 2.00 });
        assert_eq!(
            model_price("anthropic/claude-opus-4"),
            ModelPrice { input: 15.00, output: 75.00 }
        );
    }

    #[test]
    fn headroom_blocks_past_daily_cap() {
        let tracker = tracker(0.10, 100.0);
        assert!(tracker.has_headroom("p1", 0.05));
        // Burn most of the daily budget: ~0.09 USD
        tracker.record("p1", "claude-sonnet-4", 5_000, 5_000);
        assert!(!tracker.has_headroom("p1", 0.05));
        // Another provider has its own slot but shares the caps config
        assert!(tracker.has_headroom("p2", 0.05));
    }

    #[test]
    fn usage_report_accumulates() {
        let tracker = tracker(100.0, 1000.0);
        tracker.record("p1", "gpt-4o-mini", 100, 200);
        tracker.record("p1", "gpt-4o-mini", 300, 400);
        let report = tracker.usage_report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].requests, 2);
        assert_eq!(report[0].tokens_in, 400);
        assert_eq!(report[0].tokens_out, 600);
        assert!(report[0].day_usd > 0.0);
    }
}
