//! In-memory experiment store
//!
//! DashMap-backed implementation of `ExperimentStore` for tests and
//! single-process deployments. The structural invariants live here rather
//! than in the optimizer: a second running experiment for the same
//! restaurant is refused with `Conflict`, and the weekly counter rolls via
//! compare-and-swap on the stored week start.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use site_optimizer_types::{
    week_start_sunday, BaselineMetrics, CompoundChange, Experiment, ExperimentQueueItem,
    ExperimentStatus, Learning, OptimizerError, OptimizerState, Result, Variant,
};

use crate::traits::ExperimentStore;

/// DashMap-backed reference store
#[derive(Default)]
pub struct MemoryExperimentStore {
    experiments: DashMap<Uuid, Experiment>,
    variants: DashMap<Uuid, Variant>,
    states: DashMap<String, OptimizerState>,
    queue: DashMap<Uuid, ExperimentQueueItem>,
}

impl MemoryExperimentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_experiment<T>(
        &self,
        experiment_id: Uuid,
        f: impl FnOnce(&mut Experiment) -> T,
    ) -> Result<T> {
        let mut entry = self.experiments.get_mut(&experiment_id).ok_or_else(|| {
            OptimizerError::NotFound(format!("experiment {experiment_id}"))
        })?;
        Ok(f(entry.value_mut()))
    }

    fn with_variant<T>(&self, variant_id: Uuid, f: impl FnOnce(&mut Variant) -> T) -> Result<T> {
        let mut entry = self
            .variants
            .get_mut(&variant_id)
            .ok_or_else(|| OptimizerError::NotFound(format!("variant {variant_id}")))?;
        Ok(f(entry.value_mut()))
    }

    fn with_state<T>(
        &self,
        restaurant_id: &str,
        f: impl FnOnce(&mut OptimizerState) -> T,
    ) -> T {
        let mut entry = self
            .states
            .entry(restaurant_id.to_string())
            .or_insert_with(|| OptimizerState::new(restaurant_id));
        f(entry.value_mut())
    }
}

#[async_trait]
impl ExperimentStore for MemoryExperimentStore {
    async fn create_experiment(&self, experiment: Experiment) -> Result<()> {
        if self.experiments.contains_key(&experiment.id) {
            return Err(OptimizerError::Conflict(format!(
                "experiment {} already exists",
                experiment.id
            )));
        }
        self.experiments.insert(experiment.id, experiment);
        Ok(())
    }

    async fn create_variant(&self, variant: Variant) -> Result<()> {
        if !self.experiments.contains_key(&variant.experiment_id) {
            return Err(OptimizerError::NotFound(format!(
                "experiment {} for variant {}",
                variant.experiment_id, variant.id
            )));
        }
        self.variants.insert(variant.id, variant);
        Ok(())
    }

    async fn start_experiment(&self, experiment_id: Uuid) -> Result<()> {
        let restaurant_id = self
            .experiments
            .get(&experiment_id)
            .map(|e| e.restaurant_id.clone())
            .ok_or_else(|| OptimizerError::NotFound(format!("experiment {experiment_id}")))?;

        let already_running = self.experiments.iter().any(|e| {
            e.restaurant_id == restaurant_id
                && e.status == ExperimentStatus::Running
                && e.id != experiment_id
        });
        if already_running {
            return Err(OptimizerError::Conflict(format!(
                "restaurant {restaurant_id} already has a running experiment"
            )));
        }

        self.with_experiment(experiment_id, |exp| {
            exp.status = ExperimentStatus::Running;
            exp.started_at = Utc::now();
        })
    }

    async fn running_experiment(&self, restaurant_id: &str) -> Result<Option<Experiment>> {
        Ok(self
            .experiments
            .iter()
            .find(|e| e.restaurant_id == restaurant_id && e.status == ExperimentStatus::Running)
            .map(|e| e.value().clone()))
    }

    async fn experiment(&self, experiment_id: Uuid) -> Result<Option<Experiment>> {
        Ok(self.experiments.get(&experiment_id).map(|e| e.value().clone()))
    }

    async fn variants_of(&self, experiment_id: Uuid) -> Result<Vec<Variant>> {
        let mut variants: Vec<Variant> = self
            .variants
            .iter()
            .filter(|v| v.experiment_id == experiment_id)
            .map(|v| v.value().clone())
            .collect();
        variants.sort_by_key(|v| !v.is_control);
        Ok(variants)
    }

    async fn update_variant_allocation(&self, variant_id: Uuid, allocation: f64) -> Result<()> {
        self.with_variant(variant_id, |v| {
            v.traffic_allocation = allocation.clamp(0.0, 1.0);
        })
    }

    async fn update_variant_stats(
        &self,
        variant_id: Uuid,
        visitors: u64,
        conversions: u64,
        revenue: f64,
    ) -> Result<()> {
        if conversions > visitors {
            return Err(OptimizerError::Validation(format!(
                "variant {variant_id}: conversions {conversions} exceed visitors {visitors}"
            )));
        }
        self.with_variant(variant_id, |v| {
            v.visitors = visitors;
            v.conversions = conversions;
            v.revenue = revenue.max(0.0);
        })
    }

    async fn conclude_experiment(
        &self,
        experiment_id: Uuid,
        winning_variant_id: Option<Uuid>,
    ) -> Result<()> {
        self.with_experiment(experiment_id, |exp| {
            exp.status = ExperimentStatus::Concluded;
            exp.winning_variant_id = winning_variant_id;
            exp.ended_at = Some(Utc::now());
        })
    }

    async fn mark_applied(&self, experiment_id: Uuid) -> Result<()> {
        self.with_experiment(experiment_id, |exp| {
            exp.status = ExperimentStatus::Applied;
        })
    }

    async fn pause_experiment(&self, experiment_id: Uuid, reason: &str) -> Result<()> {
        self.with_experiment(experiment_id, |exp| {
            exp.status = ExperimentStatus::Paused;
            exp.pause_reason = Some(reason.to_string());
            exp.ended_at = Some(Utc::now());
        })
    }

    async fn delete_experiment(&self, experiment_id: Uuid) -> Result<()> {
        self.experiments.remove(&experiment_id);
        self.variants.retain(|_, v| v.experiment_id != experiment_id);
        debug!(%experiment_id, "deleted experiment and its variants");
        Ok(())
    }

    async fn optimizer_state(&self, restaurant_id: &str) -> Result<OptimizerState> {
        Ok(self.with_state(restaurant_id, |s| s.clone()))
    }

    async fn set_enabled(&self, restaurant_id: &str, enabled: bool) -> Result<()> {
        self.with_state(restaurant_id, |s| s.enabled = enabled);
        Ok(())
    }

    async fn try_increment_weekly_count(
        &self,
        restaurant_id: &str,
        max_per_week: u32,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.with_state(restaurant_id, |s| {
            s.roll_week_if_needed(now);
            if s.experiments_this_week >= max_per_week {
                false
            } else {
                s.experiments_this_week += 1;
                s.total_experiments += 1;
                true
            }
        }))
    }

    async fn reset_weekly_counts(&self, week_start: DateTime<Utc>) -> Result<usize> {
        let week_start = week_start_sunday(week_start);
        let mut reset = 0;
        for mut entry in self.states.iter_mut() {
            let state = entry.value_mut();
            if state.week_start < week_start {
                state.week_start = week_start;
                state.experiments_this_week = 0;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn append_learning(&self, restaurant_id: &str, learning: Learning) -> Result<()> {
        self.with_state(restaurant_id, |s| s.record_learning(learning));
        Ok(())
    }

    async fn append_compound_change(
        &self,
        restaurant_id: &str,
        change: CompoundChange,
    ) -> Result<()> {
        self.with_state(restaurant_id, |s| s.record_compound_change(change));
        Ok(())
    }

    async fn update_baseline_metrics(
        &self,
        restaurant_id: &str,
        baseline: BaselineMetrics,
    ) -> Result<()> {
        self.with_state(restaurant_id, |s| s.baseline_metrics = Some(baseline));
        Ok(())
    }

    async fn add_revenue_lift(&self, restaurant_id: &str, lift: f64) -> Result<()> {
        self.with_state(restaurant_id, |s| s.total_revenue_lift += lift);
        Ok(())
    }

    async fn record_optimization_at(
        &self,
        restaurant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_state(restaurant_id, |s| s.last_optimization_at = Some(at));
        Ok(())
    }

    async fn enabled_restaurants(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .states
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn queue_add(&self, item: ExperimentQueueItem) -> Result<()> {
        self.queue.insert(item.id, item);
        Ok(())
    }

    async fn queue_add_batch(&self, items: Vec<ExperimentQueueItem>) -> Result<usize> {
        let count = items.len();
        for item in items {
            self.queue.insert(item.id, item);
        }
        Ok(count)
    }

    async fn queue_next(&self, restaurant_id: &str) -> Result<Option<ExperimentQueueItem>> {
        let mut items: Vec<ExperimentQueueItem> = self
            .queue
            .iter()
            .filter(|i| i.restaurant_id == restaurant_id)
            .map(|i| i.value().clone())
            .collect();
        items.sort_by(|a, b| a.queue_ordering(b));
        Ok(items.into_iter().next())
    }

    async fn queue_items(&self, restaurant_id: &str) -> Result<Vec<ExperimentQueueItem>> {
        let mut items: Vec<ExperimentQueueItem> = self
            .queue
            .iter()
            .filter(|i| i.restaurant_id == restaurant_id)
            .map(|i| i.value().clone())
            .collect();
        items.sort_by(|a, b| a.queue_ordering(b));
        Ok(items)
    }

    async fn queue_count(&self, restaurant_id: &str) -> Result<usize> {
        Ok(self
            .queue
            .iter()
            .filter(|i| i.restaurant_id == restaurant_id)
            .count())
    }

    async fn queue_remove(&self, item_id: Uuid) -> Result<()> {
        self.queue.remove(&item_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use site_optimizer_types::{ChangeType, HypothesisCandidate, QueueSource};

    fn experiment(restaurant_id: &str) -> Experiment {
        Experiment::new(restaurant_id, "test hypothesis", ChangeType::Cta, 0.05)
    }

    fn queue_item(restaurant_id: &str, priority: i32) -> ExperimentQueueItem {
        ExperimentQueueItem::from_candidate(
            restaurant_id,
            HypothesisCandidate {
                hypothesis: format!("hypothesis p{priority}"),
                change_type: "cta".to_string(),
                variant_prompt: "prompt".to_string(),
                variant_description: "description".to_string(),
                priority,
            },
            QueueSource::Ai,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_single_running_experiment_enforced() {
        let store = MemoryExperimentStore::new();

        let first = experiment("r1");
        let second = experiment("r1");
        store.create_experiment(first.clone()).await.unwrap();
        store.create_experiment(second.clone()).await.unwrap();

        store.start_experiment(first.id).await.unwrap();
        let err = store.start_experiment(second.id).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Conflict(_)));

        // A different restaurant is unaffected
        let other = experiment("r2");
        store.create_experiment(other.clone()).await.unwrap();
        store.start_experiment(other.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_variants_control_first() {
        let store = MemoryExperimentStore::new();
        let exp = experiment("r1");
        store.create_experiment(exp.clone()).await.unwrap();

        let treatment = Variant::new(exp.id, "treatment", false, "new hero", None, 0.5);
        let control = Variant::new(exp.id, "control", true, "current page", None, 0.5);
        store.create_variant(treatment).await.unwrap();
        store.create_variant(control).await.unwrap();

        let variants = store.variants_of(exp.id).await.unwrap();
        assert_eq!(variants.len(), 2);
        assert!(variants[0].is_control);
        assert!(!variants[1].is_control);
    }

    #[tokio::test]
    async fn test_delete_removes_variants() {
        let store = MemoryExperimentStore::new();
        let exp = experiment("r1");
        store.create_experiment(exp.clone()).await.unwrap();
        let variant = Variant::new(exp.id, "control", true, "page", None, 0.5);
        let variant_id = variant.id;
        store.create_variant(variant).await.unwrap();

        store.delete_experiment(exp.id).await.unwrap();
        assert!(store.experiment(exp.id).await.unwrap().is_none());
        assert!(store.variants_of(exp.id).await.unwrap().is_empty());
        assert!(store
            .update_variant_allocation(variant_id, 0.5)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_weekly_cap_and_roll() {
        let store = MemoryExperimentStore::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 13, 12, 0, 0).unwrap();

        for _ in 0..3 {
            assert!(store.try_increment_weekly_count("r1", 3, now).await.unwrap());
        }
        assert!(!store.try_increment_weekly_count("r1", 3, now).await.unwrap());

        // Next week the counter rolls and the slot frees up
        let next_week = now + chrono::Duration::days(7);
        assert!(store
            .try_increment_weekly_count("r1", 3, next_week)
            .await
            .unwrap());

        let state = store.optimizer_state("r1").await.unwrap();
        assert_eq!(state.experiments_this_week, 1);
        assert_eq!(state.total_experiments, 4);
    }

    #[tokio::test]
    async fn test_queue_ordering() {
        let store = MemoryExperimentStore::new();
        store.queue_add(queue_item("r1", 3)).await.unwrap();
        store.queue_add(queue_item("r1", 9)).await.unwrap();
        store.queue_add(queue_item("r1", 5)).await.unwrap();
        store.queue_add(queue_item("r2", 10)).await.unwrap();

        assert_eq!(store.queue_count("r1").await.unwrap(), 3);

        let next = store.queue_next("r1").await.unwrap().unwrap();
        assert_eq!(next.priority, 9);

        // queue_next does not consume
        assert_eq!(store.queue_count("r1").await.unwrap(), 3);
        store.queue_remove(next.id).await.unwrap();
        assert_eq!(store.queue_count("r1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_reset_weekly_counts() {
        let store = MemoryExperimentStore::new();
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap();
        store.try_increment_weekly_count("r1", 3, now).await.unwrap();
        store.try_increment_weekly_count("r2", 3, now).await.unwrap();

        let next_week = Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap();
        let reset = store.reset_weekly_counts(next_week).await.unwrap();
        assert_eq!(reset, 2);

        let state = store.optimizer_state("r1").await.unwrap();
        assert_eq!(state.experiments_this_week, 0);
        assert_eq!(state.week_start, next_week);
    }
}
