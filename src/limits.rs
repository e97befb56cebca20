//! Rate-limit memory and cost accounting.
//!
//! [`RateTracker`] remembers recent per-model failures that looked like
//! quota or rate-limit signals and answers availability queries for the
//! router. It never blocks a call; it only steers selection away from
//! models that just failed.
//!
//! [`CostLedger`] accumulates billable usage per model, applies the
//! free-tier rule (zero cost under OAuth), and enforces the optional
//! daily cost ceiling.

use crate::types::{TokenUsage, find_model};
use crate::{Error, Result};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Consecutive failures before a model is considered unavailable.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// How long a model stays unavailable after hitting the threshold.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Default, Clone)]
struct RateRecord {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

/// Per-model availability tracker.
#[derive(Debug)]
pub struct RateTracker {
    records: HashMap<String, RateRecord>,
    threshold: u32,
    cooldown: Duration,
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_COOLDOWN)
    }
}

impl RateTracker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            records: HashMap::new(),
            threshold,
            cooldown,
        }
    }

    /// True unless the model has hit the failure threshold within the
    /// cooldown window. An elapsed cooldown resets the counter before
    /// answering.
    pub fn available(&mut self, model: &str) -> bool {
        let threshold = self.threshold;
        let cooldown = self.cooldown;
        let Some(record) = self.records.get_mut(model) else {
            return true;
        };

        if record.consecutive_failures < threshold {
            return true;
        }
        match record.last_failure {
            Some(at) if at.elapsed() < cooldown => false,
            _ => {
                record.consecutive_failures = 0;
                record.last_failure = None;
                true
            }
        }
    }

    /// Record a rate-limit-shaped failure for the model.
    pub fn record_failure(&mut self, model: &str) {
        let record = self.records.entry(model.to_string()).or_default();
        record.consecutive_failures += 1;
        record.last_failure = Some(Instant::now());
        debug!(
            model,
            failures = record.consecutive_failures,
            "rate-limit failure recorded"
        );
    }

    /// Record a success; decrements the failure counter, floored at zero.
    pub fn record_success(&mut self, model: &str) {
        if let Some(record) = self.records.get_mut(model) {
            record.consecutive_failures = record.consecutive_failures.saturating_sub(1);
        }
    }

    /// Availability snapshot for every model that has failure history.
    pub fn stats(&self) -> RateStats {
        let now = Instant::now();
        let models = self
            .records
            .iter()
            .map(|(model, record)| {
                let unavailable = record.consecutive_failures >= self.threshold
                    && record
                        .last_failure
                        .is_some_and(|at| now.duration_since(at) < self.cooldown);
                (
                    model.clone(),
                    ModelRateStats {
                        consecutive_failures: record.consecutive_failures,
                        available: !unavailable,
                    },
                )
            })
            .collect();
        RateStats { models }
    }
}

/// Serializable availability snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateStats {
    pub models: HashMap<String, ModelRateStats>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRateStats {
    pub consecutive_failures: u32,
    pub available: bool,
}

// ============================================================================
// COST LEDGER
// ============================================================================

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ModelLedgerEntry {
    pub input_units: u64,
    pub output_units: u64,
    pub requests: u64,
    pub cost_usd: f64,
}

/// Aggregated usage and cost, per model and in total.
#[derive(Debug, Default)]
pub struct CostLedger {
    entries: HashMap<String, ModelLedgerEntry>,
    day: Option<NaiveDate>,
    daily_cost_usd: f64,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate one request's usage. Cost contribution is zero when the
    /// active credential is the free variant; otherwise it comes from the
    /// model's catalog prices.
    pub fn record(&mut self, model: &str, usage: TokenUsage, free_tier: bool) {
        let cost = if free_tier {
            0.0
        } else {
            find_model(model)
                .map(|spec| spec.cost(usage.input_tokens, usage.output_tokens))
                .unwrap_or(0.0)
        };

        self.roll_day();
        self.daily_cost_usd += cost;

        let entry = self.entries.entry(model.to_string()).or_default();
        entry.input_units += usage.input_tokens;
        entry.output_units += usage.output_tokens;
        entry.requests += 1;
        entry.cost_usd += cost;
    }

    /// Cost accrued since midnight UTC.
    pub fn daily_cost_usd(&mut self) -> f64 {
        self.roll_day();
        self.daily_cost_usd
    }

    /// Enforce the configured daily ceiling, if one is set.
    pub fn check_daily_limit(&mut self, limit_usd: Option<f64>) -> Result<()> {
        let Some(limit) = limit_usd else {
            return Ok(());
        };
        let accrued = self.daily_cost_usd();
        if accrued >= limit {
            return Err(Error::budget(
                "daily_cost",
                format!("accrued ${:.4} of ${:.2} daily limit", accrued, limit),
            ));
        }
        Ok(())
    }

    /// Snapshot with per-model breakdown and global totals.
    pub fn stats(&self) -> LedgerStats {
        let mut totals = ModelLedgerEntry::default();
        for entry in self.entries.values() {
            totals.input_units += entry.input_units;
            totals.output_units += entry.output_units;
            totals.requests += entry.requests;
            totals.cost_usd += entry.cost_usd;
        }
        LedgerStats {
            models: self.entries.clone(),
            totals,
            daily_cost_usd: self.daily_cost_usd,
        }
    }

    fn roll_day(&mut self) {
        let today = Utc::now().date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            self.daily_cost_usd = 0.0;
        }
    }
}

/// Serializable ledger snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerStats {
    pub models: HashMap<String, ModelLedgerEntry>,
    pub totals: ModelLedgerEntry,
    pub daily_cost_usd: f64,
}
