//! Per-restaurant optimizer state
//!
//! One `OptimizerState` exists per restaurant, created lazily on first access
//! and never deleted. It carries the weekly rate-limit counter, the accumulated
//! learning history, and the compound-change ledger of applied winners.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::experiments::ChangeType;

/// Maximum retained learnings, most-recent-last
pub const MAX_LEARNINGS: usize = 50;

/// Maximum retained compound changes, most-recent-last
pub const MAX_COMPOUND_CHANGES: usize = 20;

/// Outcome category of a finished experiment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningOutcome {
    Success,
    ControlWon,
    NoEffect,
    PausedAnomaly,
}

/// A single learning recorded when an experiment finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub experiment_id: Uuid,
    pub outcome: LearningOutcome,
    pub hypothesis: String,
    pub change_type: ChangeType,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

/// An applied winning change retained as cumulative improvement history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompoundChange {
    pub experiment_id: Uuid,
    pub change_type: ChangeType,
    pub description: String,
    pub revenue_lift: f64,
    pub applied_at: DateTime<Utc>,
}

/// Baseline traffic snapshot used to calibrate anomaly detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineMetrics {
    pub conversion_rate: f64,
    pub visitors: u64,
    pub conversions: u64,
    pub updated_at: DateTime<Utc>,
}

/// Per-restaurant optimizer state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub restaurant_id: String,
    pub enabled: bool,
    pub experiments_this_week: u32,
    /// Start of the current rate-limit week, Sunday 00:00 UTC
    pub week_start: DateTime<Utc>,
    pub learnings: Vec<Learning>,
    pub compound_changes: Vec<CompoundChange>,
    pub baseline_metrics: Option<BaselineMetrics>,
    pub total_experiments: u64,
    pub total_revenue_lift: f64,
    pub last_optimization_at: Option<DateTime<Utc>>,
    pub last_digest_at: Option<DateTime<Utc>>,
}

impl OptimizerState {
    /// Create fresh state for a restaurant, enabled by default
    pub fn new(restaurant_id: impl Into<String>) -> Self {
        Self {
            restaurant_id: restaurant_id.into(),
            enabled: true,
            experiments_this_week: 0,
            week_start: week_start_sunday(Utc::now()),
            learnings: Vec::new(),
            compound_changes: Vec::new(),
            baseline_metrics: None,
            total_experiments: 0,
            total_revenue_lift: 0.0,
            last_optimization_at: None,
            last_digest_at: None,
        }
    }

    /// Append a learning, evicting the oldest beyond the cap
    pub fn record_learning(&mut self, learning: Learning) {
        self.learnings.push(learning);
        if self.learnings.len() > MAX_LEARNINGS {
            let excess = self.learnings.len() - MAX_LEARNINGS;
            self.learnings.drain(0..excess);
        }
    }

    /// Append a compound change, evicting the oldest beyond the cap
    pub fn record_compound_change(&mut self, change: CompoundChange) {
        self.compound_changes.push(change);
        if self.compound_changes.len() > MAX_COMPOUND_CHANGES {
            let excess = self.compound_changes.len() - MAX_COMPOUND_CHANGES;
            self.compound_changes.drain(0..excess);
        }
    }

    /// Roll the weekly counter when `now` has moved past the recorded week
    ///
    /// Returns true if the counter was reset. This is the compare-and-swap
    /// primitive backing the weekly rate limit: callers compare the stored
    /// `week_start` with the current one rather than trusting a wall-clock
    /// tick they may have missed.
    pub fn roll_week_if_needed(&mut self, now: DateTime<Utc>) -> bool {
        let current = week_start_sunday(now);
        if current > self.week_start {
            self.week_start = current;
            self.experiments_this_week = 0;
            true
        } else {
            false
        }
    }
}

/// Truncate `now` to the most recent Sunday 00:00 UTC
pub fn week_start_sunday(now: DateTime<Utc>) -> DateTime<Utc> {
    let days_from_sunday = now.weekday().num_days_from_sunday() as i64;
    let midnight = now
        .with_hour(0)
        .and_then(|t| t.with_minute(0))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    midnight - Duration::days(days_from_sunday)
}
