//! Collaborator traits
//!
//! The optimizer touches the world only through these boundaries. Every
//! method is an async suspension point; the control loop resumes
//! deterministically in issuing order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use site_optimizer_types::{
    BaselineMetrics, CompoundChange, Experiment, ExperimentQueueItem, HypothesisCandidate,
    Learning, OptimizerState, Result, Variant,
};

/// Aggregated interaction counts for one variant
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VariantMetrics {
    pub visitors: u64,
    pub conversions: u64,
    pub revenue: f64,
}

/// Historical site-wide conversion metrics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HistoricalMetrics {
    pub visitors: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

/// Durable state for experiments, variants, optimizer state, and the
/// hypothesis queue
///
/// Individual operations must be atomic. `start_experiment` and
/// `try_increment_weekly_count` are the conditional writes backing the
/// single-active-experiment invariant and the weekly rate limit; both must
/// refuse rather than overwrite when their precondition fails.
#[async_trait]
pub trait ExperimentStore: Send + Sync {
    async fn create_experiment(&self, experiment: Experiment) -> Result<()>;

    async fn create_variant(&self, variant: Variant) -> Result<()>;

    /// Transition a pending experiment to running
    ///
    /// Fails with `Conflict` if another experiment is already running for
    /// the same restaurant.
    async fn start_experiment(&self, experiment_id: Uuid) -> Result<()>;

    async fn running_experiment(&self, restaurant_id: &str) -> Result<Option<Experiment>>;

    async fn experiment(&self, experiment_id: Uuid) -> Result<Option<Experiment>>;

    /// Variants of an experiment, control first
    async fn variants_of(&self, experiment_id: Uuid) -> Result<Vec<Variant>>;

    async fn update_variant_allocation(&self, variant_id: Uuid, allocation: f64) -> Result<()>;

    async fn update_variant_stats(
        &self,
        variant_id: Uuid,
        visitors: u64,
        conversions: u64,
        revenue: f64,
    ) -> Result<()>;

    async fn conclude_experiment(
        &self,
        experiment_id: Uuid,
        winning_variant_id: Option<Uuid>,
    ) -> Result<()>;

    async fn mark_applied(&self, experiment_id: Uuid) -> Result<()>;

    async fn pause_experiment(&self, experiment_id: Uuid, reason: &str) -> Result<()>;

    /// Delete an experiment and its variant rows (rollback path)
    async fn delete_experiment(&self, experiment_id: Uuid) -> Result<()>;

    /// Get or lazily create the optimizer state for a restaurant
    async fn optimizer_state(&self, restaurant_id: &str) -> Result<OptimizerState>;

    async fn set_enabled(&self, restaurant_id: &str, enabled: bool) -> Result<()>;

    /// Atomically consume one weekly experiment slot
    ///
    /// Rolls the counter forward when the Sunday-aligned week has changed
    /// (compare-and-swap on `week_start`), then increments both the weekly
    /// counter and `total_experiments` if the cap permits. Returns false
    /// when the cap is already reached.
    async fn try_increment_weekly_count(
        &self,
        restaurant_id: &str,
        max_per_week: u32,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Reset every restaurant's weekly counter; returns how many were reset
    async fn reset_weekly_counts(&self, week_start: DateTime<Utc>) -> Result<usize>;

    async fn append_learning(&self, restaurant_id: &str, learning: Learning) -> Result<()>;

    async fn append_compound_change(
        &self,
        restaurant_id: &str,
        change: CompoundChange,
    ) -> Result<()>;

    async fn update_baseline_metrics(
        &self,
        restaurant_id: &str,
        baseline: BaselineMetrics,
    ) -> Result<()>;

    async fn add_revenue_lift(&self, restaurant_id: &str, lift: f64) -> Result<()>;

    async fn record_optimization_at(
        &self,
        restaurant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Restaurants with the optimizer enabled
    async fn enabled_restaurants(&self) -> Result<Vec<String>>;

    async fn queue_add(&self, item: ExperimentQueueItem) -> Result<()>;

    async fn queue_add_batch(&self, items: Vec<ExperimentQueueItem>) -> Result<usize>;

    /// Highest-priority queue item (priority desc, created_at asc), not removed
    async fn queue_next(&self, restaurant_id: &str) -> Result<Option<ExperimentQueueItem>>;

    async fn queue_items(&self, restaurant_id: &str) -> Result<Vec<ExperimentQueueItem>>;

    async fn queue_count(&self, restaurant_id: &str) -> Result<usize>;

    async fn queue_remove(&self, item_id: Uuid) -> Result<()>;
}

/// Aggregates raw interaction events into per-variant and historical metrics
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn variant_metrics(&self, variant_id: Uuid) -> Result<VariantMetrics>;

    async fn historical_conversion_rate(
        &self,
        restaurant_id: &str,
        days_back: i64,
        exclude_variant: Option<Uuid>,
    ) -> Result<HistoricalMetrics>;

    /// Drop analytics events older than the cutoff; returns how many went
    async fn purge_events_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Materializes, promotes, and deletes variant artifacts
#[async_trait]
pub trait VariantPublisher: Send + Sync {
    /// Generate the published artifact for a treatment variant; failing here
    /// triggers a full rollback of the experiment rows
    async fn generate_variant(
        &self,
        restaurant_id: &str,
        variant_id: Uuid,
        change_prompt: &str,
    ) -> Result<()>;

    async fn promote_variant(&self, restaurant_id: &str, variant_id: Uuid) -> Result<()>;

    /// Delete a variant's artifact; must be idempotent (deleting an
    /// already-deleted artifact is Ok)
    async fn delete_variant(&self, restaurant_id: &str, variant_id: Uuid) -> Result<()>;
}

/// Ranked candidate hypotheses from restaurant metrics and past learnings
#[async_trait]
pub trait HypothesisSource: Send + Sync {
    async fn generate_hypotheses(
        &self,
        restaurant_id: &str,
        metrics: &HistoricalMetrics,
        learnings: &[Learning],
        existing: &[ExperimentQueueItem],
        count: usize,
    ) -> Result<Vec<HypothesisCandidate>>;
}
