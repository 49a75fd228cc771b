//! End-to-end optimizer scenarios against the in-memory store and mocked
//! collaborators: starting experiments from the hypothesis queue, promoting
//! winners, reverting losers, anomaly pauses, futility stops, the weekly
//! rate limit, and rollback on variant-generation failure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use site_optimizer_config::OptimizerConfig;
use site_optimizer_engine::{
    ABOptimizer, ExperimentStore, HistoricalMetrics, HypothesisSource, MemoryExperimentStore,
    MetricsProvider, OptimizeOutcome, VariantMetrics, VariantPublisher,
};
use site_optimizer_types::{
    ChangeType, Experiment, ExperimentStatus, HypothesisCandidate, Learning, LearningOutcome,
    Result, Variant,
};

#[derive(Default)]
struct MockMetrics {
    per_variant: DashMap<Uuid, VariantMetrics>,
    historical: Mutex<Option<HistoricalMetrics>>,
    purged: AtomicU64,
}

impl MockMetrics {
    fn set_variant(&self, variant_id: Uuid, visitors: u64, conversions: u64, revenue: f64) {
        self.per_variant.insert(
            variant_id,
            VariantMetrics {
                visitors,
                conversions,
                revenue,
            },
        );
    }

    fn set_historical(&self, visitors: u64, conversions: u64) {
        *self.historical.lock().unwrap() = Some(HistoricalMetrics {
            visitors,
            conversions,
            conversion_rate: if visitors > 0 {
                conversions as f64 / visitors as f64
            } else {
                0.0
            },
        });
    }
}

#[async_trait]
impl MetricsProvider for MockMetrics {
    async fn variant_metrics(&self, variant_id: Uuid) -> Result<VariantMetrics> {
        Ok(self
            .per_variant
            .get(&variant_id)
            .map(|m| *m)
            .unwrap_or(VariantMetrics {
                visitors: 0,
                conversions: 0,
                revenue: 0.0,
            }))
    }

    async fn historical_conversion_rate(
        &self,
        _restaurant_id: &str,
        _days_back: i64,
        _exclude_variant: Option<Uuid>,
    ) -> Result<HistoricalMetrics> {
        Ok(self.historical.lock().unwrap().unwrap_or(HistoricalMetrics {
            visitors: 0,
            conversions: 0,
            conversion_rate: 0.0,
        }))
    }

    async fn purge_events_before(&self, _cutoff: DateTime<Utc>) -> Result<u64> {
        Ok(self.purged.swap(0, Ordering::SeqCst))
    }
}

#[derive(Default)]
struct MockPublisher {
    fail_generation: AtomicBool,
    /// Suspension point inside generation, to widen race windows
    generation_delay_ms: AtomicU64,
    generated: Mutex<Vec<Uuid>>,
    promoted: Mutex<Vec<Uuid>>,
    deleted: Mutex<Vec<Uuid>>,
}

#[async_trait]
impl VariantPublisher for MockPublisher {
    async fn generate_variant(
        &self,
        _restaurant_id: &str,
        variant_id: Uuid,
        _change_prompt: &str,
    ) -> Result<()> {
        if self.fail_generation.load(Ordering::SeqCst) {
            return Err(site_optimizer_types::OptimizerError::Publisher(
                "generation backend unavailable".to_string(),
            ));
        }
        let delay = self.generation_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.generated.lock().unwrap().push(variant_id);
        Ok(())
    }

    async fn promote_variant(&self, _restaurant_id: &str, variant_id: Uuid) -> Result<()> {
        self.promoted.lock().unwrap().push(variant_id);
        Ok(())
    }

    async fn delete_variant(&self, _restaurant_id: &str, variant_id: Uuid) -> Result<()> {
        self.deleted.lock().unwrap().push(variant_id);
        Ok(())
    }
}

#[derive(Default)]
struct MockHypotheses {
    candidates: Mutex<Vec<HypothesisCandidate>>,
    calls: AtomicU64,
}

impl MockHypotheses {
    fn with_candidates(candidates: Vec<HypothesisCandidate>) -> Self {
        Self {
            candidates: Mutex::new(candidates),
            calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl HypothesisSource for MockHypotheses {
    async fn generate_hypotheses(
        &self,
        _restaurant_id: &str,
        _metrics: &HistoricalMetrics,
        _learnings: &[Learning],
        _existing: &[site_optimizer_types::ExperimentQueueItem],
        count: usize,
    ) -> Result<Vec<HypothesisCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pool = self.candidates.lock().unwrap();
        Ok(pool.iter().take(count).cloned().collect())
    }
}

fn candidate(hypothesis: &str, change_type: &str, priority: i32) -> HypothesisCandidate {
    HypothesisCandidate {
        hypothesis: hypothesis.to_string(),
        change_type: change_type.to_string(),
        variant_prompt: format!("apply: {hypothesis}"),
        variant_description: hypothesis.to_string(),
        priority,
    }
}

struct Harness {
    store: Arc<MemoryExperimentStore>,
    metrics: Arc<MockMetrics>,
    publisher: Arc<MockPublisher>,
    hypotheses: Arc<MockHypotheses>,
    optimizer: ABOptimizer,
}

fn harness(candidates: Vec<HypothesisCandidate>) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryExperimentStore::new());
    let metrics = Arc::new(MockMetrics::default());
    let publisher = Arc::new(MockPublisher::default());
    let hypotheses = Arc::new(MockHypotheses::with_candidates(candidates));

    let optimizer = ABOptimizer::new(
        store.clone(),
        metrics.clone(),
        publisher.clone(),
        hypotheses.clone(),
        OptimizerConfig::default(),
    );

    Harness {
        store,
        metrics,
        publisher,
        hypotheses,
        optimizer,
    }
}

/// Insert a running two-arm experiment directly into the store
async fn seed_running_experiment(
    store: &MemoryExperimentStore,
    restaurant_id: &str,
) -> (Experiment, Variant, Variant) {
    let experiment = Experiment::new(
        restaurant_id,
        "a brighter call-to-action converts better",
        ChangeType::Cta,
        0.05,
    );
    let control = Variant::new(experiment.id, "control", true, "current page", None, 0.5);
    let treatment = Variant::new(
        experiment.id,
        "treatment",
        false,
        "brighter CTA",
        Some("make the CTA brighter".to_string()),
        0.5,
    );

    store.create_experiment(experiment.clone()).await.unwrap();
    store.create_variant(control.clone()).await.unwrap();
    store.create_variant(treatment.clone()).await.unwrap();
    store.start_experiment(experiment.id).await.unwrap();

    (experiment, control, treatment)
}

#[tokio::test]
async fn starts_experiment_from_generated_hypotheses() {
    let h = harness(vec![
        candidate("larger menu photos draw orders", "menu", 8),
        candidate("warmer hero copy", "hero", 5),
    ]);
    h.metrics.set_historical(2000, 100);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Started { hypothesis, .. } = outcome else {
        panic!("expected Started, got {outcome:?}");
    };
    // Highest-priority candidate goes first
    assert_eq!(hypothesis, "larger menu photos draw orders");

    let running = h.store.running_experiment("r1").await.unwrap().unwrap();
    assert_eq!(running.status, ExperimentStatus::Running);
    assert_eq!(running.change_type, ChangeType::Menu);
    // Baseline snapshotted from historical metrics at creation time
    assert!((running.baseline_conversion_rate - 0.05).abs() < 1e-9);

    // Treatment artifact generated, queue item consumed, weekly slot taken
    assert_eq!(h.publisher.generated.lock().unwrap().len(), 1);
    let state = h.store.optimizer_state("r1").await.unwrap();
    assert_eq!(state.experiments_this_week, 1);
    assert_eq!(state.total_experiments, 1);

    // The second candidate is still queued for next time
    assert_eq!(h.store.queue_count("r1").await.unwrap(), 1);
}

#[tokio::test]
async fn no_experiment_without_traffic() {
    let h = harness(vec![candidate("anything", "cta", 5)]);
    h.metrics.set_historical(20, 1);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    assert!(matches!(outcome, OptimizeOutcome::Skipped { .. }));
    assert!(h.store.running_experiment("r1").await.unwrap().is_none());
    // Hypothesis generation was never attempted below the pageview gate
    assert_eq!(h.hypotheses.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn applies_winning_treatment() {
    let h = harness(vec![]);
    h.metrics.set_historical(5000, 250);
    let (experiment, control, treatment) = seed_running_experiment(&h.store, "r1").await;

    // 4.5% vs 9.0% over 1000 visitors each: decisively significant, and the
    // revenue signal agrees
    h.metrics.set_variant(control.id, 1000, 45, 900.0);
    h.metrics.set_variant(treatment.id, 1000, 90, 1800.0);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Applied {
        experiment_id,
        relative_lift,
        revenue_lift,
        ..
    } = outcome
    else {
        panic!("expected Applied, got {outcome:?}");
    };
    assert_eq!(experiment_id, experiment.id);
    assert!((relative_lift - 1.0).abs() < 1e-9);
    assert!((revenue_lift - 1.0).abs() < 1e-9);

    let stored = h.store.experiment(experiment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExperimentStatus::Applied);
    assert_eq!(stored.winning_variant_id, Some(treatment.id));

    assert_eq!(h.publisher.promoted.lock().unwrap().as_slice(), &[treatment.id]);
    assert!(h.publisher.deleted.lock().unwrap().is_empty());

    let state = h.store.optimizer_state("r1").await.unwrap();
    assert!((state.total_revenue_lift - 1.0).abs() < 1e-9);
    assert_eq!(state.learnings.len(), 1);
    assert_eq!(state.learnings[0].outcome, LearningOutcome::Success);
    assert_eq!(state.compound_changes.len(), 1);
    assert_eq!(state.compound_changes[0].experiment_id, experiment.id);
}

#[tokio::test]
async fn reverts_when_control_wins() {
    let h = harness(vec![]);
    h.metrics.set_historical(5000, 250);
    let (experiment, control, treatment) = seed_running_experiment(&h.store, "r1").await;

    h.metrics.set_variant(control.id, 1000, 90, 1800.0);
    h.metrics.set_variant(treatment.id, 1000, 45, 900.0);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Reverted { outcome, .. } = outcome else {
        panic!("expected Reverted, got {outcome:?}");
    };
    assert_eq!(outcome, LearningOutcome::ControlWon);

    let stored = h.store.experiment(experiment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExperimentStatus::Concluded);
    assert_eq!(stored.winning_variant_id, Some(control.id));

    assert_eq!(h.publisher.deleted.lock().unwrap().as_slice(), &[treatment.id]);
    assert!(h.publisher.promoted.lock().unwrap().is_empty());

    let state = h.store.optimizer_state("r1").await.unwrap();
    assert_eq!(state.learnings[0].outcome, LearningOutcome::ControlWon);
}

#[tokio::test]
async fn stops_futile_experiment_without_winner() {
    let h = harness(vec![]);
    h.metrics.set_historical(5000, 250);
    let (experiment, control, treatment) = seed_running_experiment(&h.store, "r1").await;

    // Both arms past 4x the minimum sample with indistinguishable rates
    h.metrics.set_variant(control.id, 500, 25, 500.0);
    h.metrics.set_variant(treatment.id, 500, 26, 520.0);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Reverted { outcome, .. } = outcome else {
        panic!("expected Reverted, got {outcome:?}");
    };
    assert_eq!(outcome, LearningOutcome::NoEffect);

    let stored = h.store.experiment(experiment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExperimentStatus::Concluded);
    assert_eq!(stored.winning_variant_id, None);
}

#[tokio::test]
async fn pauses_on_treatment_collapse() {
    let h = harness(vec![]);
    // 5% baseline
    h.metrics.set_historical(5000, 250);
    let (experiment, control, treatment) = seed_running_experiment(&h.store, "r1").await;

    // Control tracks baseline; treatment converts far below 30% of it
    h.metrics.set_variant(control.id, 150, 8, 160.0);
    h.metrics.set_variant(treatment.id, 150, 1, 20.0);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Paused { reason, .. } = outcome else {
        panic!("expected Paused, got {outcome:?}");
    };
    assert!(reason.contains("below"), "unexpected reason: {reason}");

    let stored = h.store.experiment(experiment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExperimentStatus::Paused);
    assert!(stored.pause_reason.is_some());

    // Artifact removed before the pause landed
    assert_eq!(h.publisher.deleted.lock().unwrap().as_slice(), &[treatment.id]);

    let state = h.store.optimizer_state("r1").await.unwrap();
    assert_eq!(state.learnings[0].outcome, LearningOutcome::PausedAnomaly);
}

#[tokio::test]
async fn pauses_on_critical_control_anomaly() {
    let h = harness(vec![]);
    // 5% baseline, control collapses to 1% (an 80% drop)
    h.metrics.set_historical(5000, 250);
    let (experiment, control, treatment) = seed_running_experiment(&h.store, "r1").await;

    h.metrics.set_variant(control.id, 200, 2, 40.0);
    h.metrics.set_variant(treatment.id, 200, 9, 180.0);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Paused { reason, .. } = outcome else {
        panic!("expected Paused, got {outcome:?}");
    };
    assert!(reason.contains("control"), "unexpected reason: {reason}");

    let stored = h.store.experiment(experiment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExperimentStatus::Paused);
}

#[tokio::test]
async fn continues_while_collecting() {
    let h = harness(vec![]);
    h.metrics.set_historical(5000, 250);
    let (experiment, control, treatment) = seed_running_experiment(&h.store, "r1").await;

    // Below the 100-visitor minimum per arm
    h.metrics.set_variant(control.id, 60, 3, 60.0);
    h.metrics.set_variant(treatment.id, 55, 4, 80.0);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Continue { allocation, .. } = outcome else {
        panic!("expected Continue, got {outcome:?}");
    };

    // Allocations sum to one and both arms keep the exploration floor
    assert!((allocation.0 + allocation.1 - 1.0).abs() < 1e-9);
    assert!(allocation.0 >= 0.10 - 1e-9);
    assert!(allocation.1 >= 0.10 - 1e-9);

    // Fresh counts were persisted and allocations written back
    let variants = h.store.variants_of(experiment.id).await.unwrap();
    assert_eq!(variants[0].visitors, 60);
    assert_eq!(variants[1].visitors, 55);
    assert!((variants[0].traffic_allocation - allocation.0).abs() < 1e-9);
}

#[tokio::test]
async fn weekly_cap_blocks_new_experiments() {
    let h = harness(vec![candidate("try a new hero image", "hero", 6)]);
    h.metrics.set_historical(2000, 100);

    // Burn all three weekly slots
    for _ in 0..3 {
        assert!(h
            .store
            .try_increment_weekly_count("r1", 3, Utc::now())
            .await
            .unwrap());
    }

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Skipped { reason } = outcome else {
        panic!("expected Skipped, got {outcome:?}");
    };
    assert!(reason.contains("weekly"), "unexpected reason: {reason}");

    // Nothing started and the queued hypothesis survives for next week
    assert!(h.store.running_experiment("r1").await.unwrap().is_none());
    assert_eq!(h.store.queue_count("r1").await.unwrap(), 1);
}

#[tokio::test]
async fn rolls_back_when_generation_fails() {
    let h = harness(vec![candidate("bolder CTA", "cta", 7)]);
    h.metrics.set_historical(2000, 100);
    h.publisher.fail_generation.store(true, Ordering::SeqCst);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    let OptimizeOutcome::Skipped { reason } = outcome else {
        panic!("expected Skipped, got {outcome:?}");
    };
    assert!(reason.contains("generation"), "unexpected reason: {reason}");

    // Experiment rows rolled back; the broken hypothesis is not retried
    assert!(h.store.running_experiment("r1").await.unwrap().is_none());
    assert_eq!(h.store.queue_count("r1").await.unwrap(), 0);
}

#[tokio::test]
async fn malformed_candidates_are_discarded() {
    let h = harness(vec![
        candidate("", "cta", 5),
        candidate("valid hypothesis", "popup", 5),
        candidate("swap hero image", "hero", 9),
    ]);
    h.metrics.set_historical(2000, 100);

    let outcome = h.optimizer.optimize("r1").await.unwrap();

    // Only the well-formed candidate survives validation
    let OptimizeOutcome::Started { hypothesis, .. } = outcome else {
        panic!("expected Started, got {outcome:?}");
    };
    assert_eq!(hypothesis, "swap hero image");
}

#[tokio::test]
async fn concurrent_cycles_start_only_one_experiment() {
    let h = harness(vec![
        candidate("bolder CTA", "cta", 7),
        candidate("warmer hero copy", "hero", 5),
    ]);
    h.metrics.set_historical(2000, 100);
    // Generation suspends mid-cycle; without the per-restaurant lock both
    // callers would read "no running experiment" and both would create one
    h.publisher.generation_delay_ms.store(50, Ordering::SeqCst);

    let (a, b) = tokio::join!(h.optimizer.optimize("r1"), h.optimizer.optimize("r1"));
    let (a, b) = (a.unwrap(), b.unwrap());

    let started = usize::from(matches!(a, OptimizeOutcome::Started { .. }))
        + usize::from(matches!(b, OptimizeOutcome::Started { .. }));
    assert_eq!(started, 1, "got {a:?} and {b:?}");

    // The loser of the race sees the winner's running experiment
    let continued = usize::from(matches!(a, OptimizeOutcome::Continue { .. }))
        + usize::from(matches!(b, OptimizeOutcome::Continue { .. }));
    assert_eq!(continued, 1, "got {a:?} and {b:?}");

    let state = h.store.optimizer_state("r1").await.unwrap();
    assert_eq!(state.total_experiments, 1);
    assert_eq!(state.experiments_this_week, 1);
    assert_eq!(h.publisher.generated.lock().unwrap().len(), 1);
    assert!(h.store.running_experiment("r1").await.unwrap().is_some());
}

#[tokio::test]
async fn disabled_restaurant_is_skipped() {
    let h = harness(vec![candidate("anything", "cta", 5)]);
    h.metrics.set_historical(2000, 100);
    h.store.set_enabled("r1", false).await.unwrap();

    let outcome = h.optimizer.optimize("r1").await.unwrap();
    assert!(matches!(outcome, OptimizeOutcome::Disabled));
    assert_eq!(h.hypotheses.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn revert_to_control_is_idempotent() {
    let h = harness(vec![]);
    let (experiment, control, treatment) = seed_running_experiment(&h.store, "r1").await;

    h.optimizer.revert_to_control(experiment.id).await.unwrap();
    h.optimizer.revert_to_control(experiment.id).await.unwrap();

    let stored = h.store.experiment(experiment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ExperimentStatus::Concluded);
    assert_eq!(stored.winning_variant_id, Some(control.id));

    // The artifact was only deleted on the first call
    assert_eq!(h.publisher.deleted.lock().unwrap().as_slice(), &[treatment.id]);
}

#[tokio::test]
async fn status_reports_active_experiment() {
    let h = harness(vec![]);
    h.metrics.set_historical(5000, 250);
    let (experiment, control, treatment) = seed_running_experiment(&h.store, "r1").await;
    h.store
        .update_variant_stats(control.id, 60, 3, 60.0)
        .await
        .unwrap();
    h.store
        .update_variant_stats(treatment.id, 55, 4, 80.0)
        .await
        .unwrap();

    let status = h.optimizer.status("r1").await.unwrap();

    assert!(status.enabled);
    assert_eq!(status.max_experiments_per_week, 3);
    let active = status.active_experiment.expect("active experiment");
    assert_eq!(active.experiment_id, experiment.id);
    assert_eq!(active.control.visitors, 60);
    assert_eq!(active.treatment.visitors, 55);
    assert_eq!(active.status_message, "collecting data");
}

#[tokio::test]
async fn baseline_refreshes_with_sufficient_traffic() {
    let h = harness(vec![]);
    h.metrics.set_historical(400, 28);

    // No experiment, no hypotheses: the cycle is otherwise a no-op
    let outcome = h.optimizer.optimize("r1").await.unwrap();
    assert!(matches!(outcome, OptimizeOutcome::Skipped { .. }));

    let state = h.store.optimizer_state("r1").await.unwrap();
    let baseline = state.baseline_metrics.expect("baseline set");
    assert!((baseline.conversion_rate - 0.07).abs() < 1e-9);
    assert_eq!(baseline.visitors, 400);
    assert!(state.last_optimization_at.is_some());
}
