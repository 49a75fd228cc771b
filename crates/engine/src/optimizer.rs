//! The per-restaurant optimization control loop
//!
//! One `optimize` call per restaurant per cycle: refresh the baseline
//! snapshot, drive the running experiment toward a verdict (or pause it on
//! an anomaly), and when none is running, replenish the hypothesis queue and
//! start the next experiment under the weekly cap.
//!
//! Decisions are data: the returned `OptimizeOutcome` carries what happened
//! and why. Only unrecoverable I/O failures surface as errors.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use site_optimizer_config::OptimizerConfig;
use site_optimizer_stats::{
    analyze_with_revenue, combined_winner, experiment_status, should_pause, traffic_allocation,
    AnomalyThresholds, ArmObservations, ArmSide, DecisionThresholds, ExperimentVerdict,
    RevenueAnalysis, WinnerConfidence,
};
use site_optimizer_types::{
    BaselineMetrics, ChangeType, CompoundChange, Experiment, ExperimentQueueItem, Learning,
    LearningOutcome, OptimizerError, QueueSource, Result, Variant,
};

use crate::traits::{ExperimentStore, HypothesisSource, MetricsProvider, VariantPublisher};

/// Trailing window for the baseline conversion-rate snapshot
const BASELINE_DAYS: i64 = 30;

/// Trailing window for the queue-replenishment pageview gate
const PAGEVIEW_WINDOW_DAYS: i64 = 14;

/// Structured result of one optimization cycle for one restaurant
#[derive(Debug, Clone)]
pub enum OptimizeOutcome {
    /// Optimizer disabled for this restaurant
    Disabled,
    /// A new experiment went live
    Started {
        experiment_id: Uuid,
        hypothesis: String,
    },
    /// Running experiment still collecting; allocation refreshed
    Continue {
        experiment_id: Uuid,
        control: ArmObservations,
        treatment: ArmObservations,
        allocation: (f64, f64),
    },
    /// Treatment won and was promoted to production
    Applied {
        experiment_id: Uuid,
        relative_lift: f64,
        revenue_lift: f64,
        confidence: WinnerConfidence,
    },
    /// Control retained; treatment artifact deleted
    Reverted {
        experiment_id: Uuid,
        outcome: LearningOutcome,
    },
    /// Anomaly-triggered early termination
    Paused {
        experiment_id: Uuid,
        reason: String,
    },
    /// Nothing to do this cycle
    Skipped { reason: String },
}

/// Snapshot of one arm for the operator status query
#[derive(Debug, Clone, serde::Serialize)]
pub struct ArmSnapshot {
    pub name: String,
    pub visitors: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub revenue: f64,
    pub traffic_allocation: f64,
}

impl From<&Variant> for ArmSnapshot {
    fn from(v: &Variant) -> Self {
        Self {
            name: v.name.clone(),
            visitors: v.visitors,
            conversions: v.conversions,
            conversion_rate: v.conversion_rate(),
            revenue: v.revenue,
            traffic_allocation: v.traffic_allocation,
        }
    }
}

/// Active-experiment section of the operator status query
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveExperimentStatus {
    pub experiment_id: Uuid,
    pub hypothesis: String,
    pub change_type: ChangeType,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub control: ArmSnapshot,
    pub treatment: ArmSnapshot,
    pub status_message: String,
}

/// Operator-visible optimizer status for one restaurant
#[derive(Debug, Clone, serde::Serialize)]
pub struct OptimizerStatus {
    pub restaurant_id: String,
    pub enabled: bool,
    pub experiments_this_week: u32,
    pub max_experiments_per_week: u32,
    pub total_experiments: u64,
    pub total_revenue_lift: f64,
    pub queue_depth: usize,
    pub last_optimization_at: Option<chrono::DateTime<chrono::Utc>>,
    pub active_experiment: Option<ActiveExperimentStatus>,
}

/// The A/B-testing control-loop orchestrator
pub struct ABOptimizer {
    store: Arc<dyn ExperimentStore>,
    metrics: Arc<dyn MetricsProvider>,
    publisher: Arc<dyn VariantPublisher>,
    hypotheses: Arc<dyn HypothesisSource>,
    config: OptimizerConfig,
    /// Advisory per-restaurant locks: a scheduled cycle and a manual trigger
    /// for the same restaurant must not interleave
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ABOptimizer {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        metrics: Arc<dyn MetricsProvider>,
        publisher: Arc<dyn VariantPublisher>,
        hypotheses: Arc<dyn HypothesisSource>,
        config: OptimizerConfig,
    ) -> Self {
        Self {
            store,
            metrics,
            publisher,
            hypotheses,
            config,
            locks: DashMap::new(),
        }
    }

    fn restaurant_lock(&self, restaurant_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(restaurant_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn anomaly_thresholds(&self) -> AnomalyThresholds {
        let a = &self.config.anomaly;
        AnomalyThresholds {
            min_sample_size: a.min_sample_size,
            z_threshold: a.z_threshold,
            critical_drop_ratio: a.critical_drop_ratio,
            treatment_floor_ratio: a.treatment_floor_ratio,
            treatment_min_visitors: a.treatment_min_visitors,
        }
    }

    fn decision_thresholds(&self) -> DecisionThresholds {
        let e = &self.config.experiments;
        DecisionThresholds {
            min_sample_size: e.min_sample_size,
            confidence_level: e.confidence_level,
            futility_multiplier: e.futility_multiplier,
            futility_p_value: e.futility_p_value,
        }
    }

    /// Run one optimization cycle for one restaurant
    pub async fn optimize(&self, restaurant_id: &str) -> Result<OptimizeOutcome> {
        let lock = self.restaurant_lock(restaurant_id);
        let _guard = lock.lock().await;

        let state = self.store.optimizer_state(restaurant_id).await?;
        if !state.enabled {
            debug!(restaurant_id, "optimizer disabled, skipping");
            return Ok(OptimizeOutcome::Disabled);
        }

        self.refresh_baseline(restaurant_id).await?;

        let outcome = match self.store.running_experiment(restaurant_id).await? {
            Some(experiment) => self.drive_running_experiment(&experiment).await?,
            None => self.maybe_start_experiment(restaurant_id).await?,
        };

        self.store
            .record_optimization_at(restaurant_id, Utc::now())
            .await?;

        Ok(outcome)
    }

    /// Refresh the baseline snapshot when enough historical traffic exists
    ///
    /// Keeps anomaly detection calibrated; thin-traffic restaurants keep
    /// their previous snapshot.
    async fn refresh_baseline(&self, restaurant_id: &str) -> Result<()> {
        let historical = self
            .metrics
            .historical_conversion_rate(restaurant_id, BASELINE_DAYS, None)
            .await?;

        if historical.visitors >= self.config.experiments.min_baseline_visitors {
            self.store
                .update_baseline_metrics(
                    restaurant_id,
                    BaselineMetrics {
                        conversion_rate: historical.conversion_rate,
                        visitors: historical.visitors,
                        conversions: historical.conversions,
                        updated_at: Utc::now(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Anomaly check, traffic reallocation, analysis, decision - in that order
    async fn drive_running_experiment(&self, experiment: &Experiment) -> Result<OptimizeOutcome> {
        let restaurant_id = experiment.restaurant_id.as_str();
        let (control_variant, treatment_variant) = self.arms_of(experiment.id).await?;

        // Fresh metrics first; every later decision works off these counts
        let control = self.refresh_arm(&control_variant).await?;
        let treatment = self.refresh_arm(&treatment_variant).await?;

        let state = self.store.optimizer_state(restaurant_id).await?;
        let baseline_rate = state
            .baseline_metrics
            .as_ref()
            .map(|b| b.conversion_rate)
            .unwrap_or(experiment.baseline_conversion_rate);

        let pause = should_pause(&control, &treatment, baseline_rate, &self.anomaly_thresholds());
        if pause.should_pause {
            let reason = pause.reason.unwrap_or_else(|| "anomaly detected".to_string());
            warn!(restaurant_id, experiment_id = %experiment.id, %reason, "pausing experiment");

            self.delete_treatment_artifact(restaurant_id, &treatment_variant).await?;
            self.store.pause_experiment(experiment.id, &reason).await?;
            self.record_learning(
                experiment,
                LearningOutcome::PausedAnomaly,
                format!("paused: {reason}"),
            )
            .await?;

            return Ok(OptimizeOutcome::Paused {
                experiment_id: experiment.id,
                reason,
            });
        }

        // Shift traffic toward the likely winner while the experiment runs
        let arms = [control, treatment];
        let allocation = {
            let mut rng = rand::thread_rng();
            traffic_allocation(
                &arms,
                self.config.experiments.exploration_floor,
                self.config.experiments.thompson_samples,
                &mut rng,
            )
            .map_err(|e| OptimizerError::Analysis(e.to_string()))?
        };
        self.store
            .update_variant_allocation(control_variant.id, allocation[0])
            .await?;
        self.store
            .update_variant_allocation(treatment_variant.id, allocation[1])
            .await?;

        let verdict = experiment_status(&control, &treatment, &self.decision_thresholds());
        let analysis =
            analyze_with_revenue(&control, &treatment, self.config.experiments.confidence_level);

        match verdict {
            ExperimentVerdict::Collecting | ExperimentVerdict::Running => {
                debug!(
                    restaurant_id,
                    experiment_id = %experiment.id,
                    control_rate = control.conversion_rate(),
                    treatment_rate = treatment.conversion_rate(),
                    "experiment continuing"
                );
                Ok(OptimizeOutcome::Continue {
                    experiment_id: experiment.id,
                    control,
                    treatment,
                    allocation: (allocation[0], allocation[1]),
                })
            }
            ExperimentVerdict::Significant { .. } | ExperimentVerdict::Futile => {
                self.conclude(
                    experiment,
                    &control_variant,
                    &treatment_variant,
                    &analysis,
                    verdict == ExperimentVerdict::Futile,
                )
                .await
            }
        }
    }

    /// Act on a finished experiment: promote the combined winner or revert
    async fn conclude(
        &self,
        experiment: &Experiment,
        control_variant: &Variant,
        treatment_variant: &Variant,
        analysis: &RevenueAnalysis,
        futile: bool,
    ) -> Result<OptimizeOutcome> {
        let restaurant_id = experiment.restaurant_id.as_str();
        let verdict = combined_winner(
            &analysis.conversion,
            analysis.relative_revenue_lift,
            analysis.revenue_significant,
        );

        if verdict.winner == Some(ArmSide::Treatment) {
            info!(
                restaurant_id,
                experiment_id = %experiment.id,
                relative_lift = analysis.conversion.relative_lift,
                revenue_lift = analysis.relative_revenue_lift,
                "promoting treatment to production"
            );

            self.publisher
                .promote_variant(restaurant_id, treatment_variant.id)
                .await?;
            self.store
                .conclude_experiment(experiment.id, Some(treatment_variant.id))
                .await?;
            self.store.mark_applied(experiment.id).await?;
            self.store
                .add_revenue_lift(restaurant_id, analysis.relative_revenue_lift)
                .await?;
            self.record_learning(
                experiment,
                LearningOutcome::Success,
                format!(
                    "treatment won: {:+.1}% conversions, {:+.1}% revenue per visitor",
                    analysis.conversion.relative_lift * 100.0,
                    analysis.relative_revenue_lift * 100.0
                ),
            )
            .await?;
            self.store
                .append_compound_change(
                    restaurant_id,
                    CompoundChange {
                        experiment_id: experiment.id,
                        change_type: experiment.change_type,
                        description: treatment_variant.change_description.clone(),
                        revenue_lift: analysis.relative_revenue_lift,
                        applied_at: Utc::now(),
                    },
                )
                .await?;

            return Ok(OptimizeOutcome::Applied {
                experiment_id: experiment.id,
                relative_lift: analysis.conversion.relative_lift,
                revenue_lift: analysis.relative_revenue_lift,
                confidence: verdict.confidence,
            });
        }

        // Control stands: delete the treatment artifact and close out
        let (winner, outcome, detail) = if futile && verdict.winner.is_none() {
            (
                None,
                LearningOutcome::NoEffect,
                "no measurable effect, stopped for futility".to_string(),
            )
        } else {
            (
                Some(control_variant.id),
                LearningOutcome::ControlWon,
                format!(
                    "control won: treatment moved conversions {:+.1}%",
                    analysis.conversion.relative_lift * 100.0
                ),
            )
        };

        info!(restaurant_id, experiment_id = %experiment.id, ?outcome, "reverting to control");

        self.delete_treatment_artifact(restaurant_id, treatment_variant).await?;
        self.store.conclude_experiment(experiment.id, winner).await?;
        self.record_learning(experiment, outcome, detail).await?;

        Ok(OptimizeOutcome::Reverted {
            experiment_id: experiment.id,
            outcome,
        })
    }

    /// Queue replenishment and experiment start, under the weekly cap
    async fn maybe_start_experiment(&self, restaurant_id: &str) -> Result<OptimizeOutcome> {
        self.ensure_queue_filled(restaurant_id).await;

        let item = match self.store.queue_next(restaurant_id).await? {
            Some(item) => item,
            None => match self.generate_one_synchronously(restaurant_id).await? {
                Some(item) => item,
                None => {
                    return Ok(OptimizeOutcome::Skipped {
                        reason: "hypothesis queue empty".to_string(),
                    })
                }
            },
        };

        // Atomic slot reservation: refused when the weekly cap is reached
        let slot = self
            .store
            .try_increment_weekly_count(
                restaurant_id,
                self.config.experiments.max_experiments_per_week,
                Utc::now(),
            )
            .await?;
        if !slot {
            debug!(restaurant_id, "weekly experiment cap reached");
            return Ok(OptimizeOutcome::Skipped {
                reason: "weekly experiment cap reached".to_string(),
            });
        }

        self.start_experiment_from_item(restaurant_id, item).await
    }

    /// Materialize a queue item into a live experiment
    ///
    /// The queue item is consumed exactly once whether generation succeeds
    /// or fails; a hypothesis whose variant cannot be generated must not be
    /// reprocessed forever. Failed generation rolls back the freshly created
    /// experiment and variant rows.
    async fn start_experiment_from_item(
        &self,
        restaurant_id: &str,
        item: ExperimentQueueItem,
    ) -> Result<OptimizeOutcome> {
        let state = self.store.optimizer_state(restaurant_id).await?;
        let baseline_rate = state
            .baseline_metrics
            .as_ref()
            .map(|b| b.conversion_rate)
            .unwrap_or(0.0);

        let experiment = Experiment::new(
            restaurant_id,
            item.hypothesis.clone(),
            item.change_type,
            baseline_rate,
        );
        let control = Variant::new(
            experiment.id,
            "control",
            true,
            "current production page",
            None,
            0.5,
        );
        let treatment = Variant::new(
            experiment.id,
            "treatment",
            false,
            item.variant_description.clone(),
            Some(item.variant_prompt.clone()),
            0.5,
        );
        let treatment_id = treatment.id;

        self.store.create_experiment(experiment.clone()).await?;
        self.store.create_variant(control).await?;
        self.store.create_variant(treatment).await?;

        match self
            .publisher
            .generate_variant(restaurant_id, treatment_id, &item.variant_prompt)
            .await
        {
            Ok(()) => {
                self.store.start_experiment(experiment.id).await?;
                self.store.queue_remove(item.id).await?;
                info!(
                    restaurant_id,
                    experiment_id = %experiment.id,
                    hypothesis = %item.hypothesis,
                    "experiment started"
                );
                Ok(OptimizeOutcome::Started {
                    experiment_id: experiment.id,
                    hypothesis: item.hypothesis,
                })
            }
            Err(e) => {
                warn!(
                    restaurant_id,
                    experiment_id = %experiment.id,
                    error = %e,
                    "variant generation failed, rolling back"
                );
                self.store.delete_experiment(experiment.id).await?;
                self.store.queue_remove(item.id).await?;
                Ok(OptimizeOutcome::Skipped {
                    reason: format!("variant generation failed: {e}"),
                })
            }
        }
    }

    /// Top the queue up to the configured depth
    ///
    /// Skipped entirely below the 14-day pageview threshold: without traffic
    /// there is no signal worth generating hypotheses from. Failures here
    /// are logged, not propagated - the queue stays short and is retried
    /// next cycle.
    async fn ensure_queue_filled(&self, restaurant_id: &str) {
        if let Err(e) = self.try_fill_queue(restaurant_id).await {
            warn!(restaurant_id, error = %e, "queue replenishment failed");
        }
    }

    async fn try_fill_queue(&self, restaurant_id: &str) -> Result<()> {
        let depth = self.store.queue_count(restaurant_id).await?;
        if depth >= self.config.experiments.min_queue_depth {
            return Ok(());
        }

        let recent = self
            .metrics
            .historical_conversion_rate(restaurant_id, PAGEVIEW_WINDOW_DAYS, None)
            .await?;
        if recent.visitors < self.config.experiments.min_pageviews_for_hypotheses {
            debug!(
                restaurant_id,
                visitors = recent.visitors,
                "insufficient traffic for hypothesis generation"
            );
            return Ok(());
        }

        let state = self.store.optimizer_state(restaurant_id).await?;
        let existing = self.store.queue_items(restaurant_id).await?;
        let candidates = self
            .hypotheses
            .generate_hypotheses(
                restaurant_id,
                &recent,
                &state.learnings,
                &existing,
                self.config.experiments.queue_refill_batch,
            )
            .await?;

        let mut accepted = Vec::new();
        for candidate in candidates {
            match ExperimentQueueItem::from_candidate(restaurant_id, candidate, QueueSource::Ai) {
                Ok(item) => accepted.push(item),
                Err(e) => warn!(restaurant_id, error = %e, "discarding malformed candidate"),
            }
        }

        let added = self.store.queue_add_batch(accepted).await?;
        info!(restaurant_id, added, "hypothesis queue replenished");
        Ok(())
    }

    /// Fallback when the queue is empty despite replenishment: ask for a
    /// single hypothesis synchronously
    async fn generate_one_synchronously(
        &self,
        restaurant_id: &str,
    ) -> Result<Option<ExperimentQueueItem>> {
        let recent = self
            .metrics
            .historical_conversion_rate(restaurant_id, PAGEVIEW_WINDOW_DAYS, None)
            .await?;
        if recent.visitors < self.config.experiments.min_pageviews_for_hypotheses {
            return Ok(None);
        }

        let state = self.store.optimizer_state(restaurant_id).await?;
        let candidates = self
            .hypotheses
            .generate_hypotheses(restaurant_id, &recent, &state.learnings, &[], 1)
            .await?;

        for candidate in candidates {
            match ExperimentQueueItem::from_candidate(restaurant_id, candidate, QueueSource::Ai) {
                Ok(item) => {
                    self.store.queue_add(item.clone()).await?;
                    return Ok(Some(item));
                }
                Err(e) => warn!(restaurant_id, error = %e, "discarding malformed candidate"),
            }
        }
        Ok(None)
    }

    /// Revert an experiment to control, tolerating repeated calls
    ///
    /// A second revert of an already-terminal experiment is a no-op: the
    /// artifact was deleted the first time and must not be deleted again.
    pub async fn revert_to_control(&self, experiment_id: Uuid) -> Result<()> {
        let experiment = self
            .store
            .experiment(experiment_id)
            .await?
            .ok_or_else(|| OptimizerError::NotFound(format!("experiment {experiment_id}")))?;

        if experiment.is_terminal() {
            debug!(experiment_id = %experiment_id, "already terminal, revert is a no-op");
            return Ok(());
        }

        let (control_variant, treatment_variant) = self.arms_of(experiment.id).await?;
        self.delete_treatment_artifact(&experiment.restaurant_id, &treatment_variant)
            .await?;
        self.store
            .conclude_experiment(experiment.id, Some(control_variant.id))
            .await?;
        Ok(())
    }

    /// Operator-visible status for one restaurant
    pub async fn status(&self, restaurant_id: &str) -> Result<OptimizerStatus> {
        let state = self.store.optimizer_state(restaurant_id).await?;
        let queue_depth = self.store.queue_count(restaurant_id).await?;

        let active_experiment = match self.store.running_experiment(restaurant_id).await? {
            Some(experiment) => {
                let (control_variant, treatment_variant) = self.arms_of(experiment.id).await?;
                let control = arm_observations(&control_variant);
                let treatment = arm_observations(&treatment_variant);
                let verdict = experiment_status(&control, &treatment, &self.decision_thresholds());

                let status_message = match verdict {
                    ExperimentVerdict::Collecting => "collecting data".to_string(),
                    ExperimentVerdict::Running => "running, no verdict yet".to_string(),
                    ExperimentVerdict::Futile => "futile, ending next cycle".to_string(),
                    ExperimentVerdict::Significant { winner, .. } => {
                        format!("significant, {winner:?} ahead")
                    }
                };

                Some(ActiveExperimentStatus {
                    experiment_id: experiment.id,
                    hypothesis: experiment.hypothesis.clone(),
                    change_type: experiment.change_type,
                    started_at: experiment.started_at,
                    control: ArmSnapshot::from(&control_variant),
                    treatment: ArmSnapshot::from(&treatment_variant),
                    status_message,
                })
            }
            None => None,
        };

        Ok(OptimizerStatus {
            restaurant_id: restaurant_id.to_string(),
            enabled: state.enabled,
            experiments_this_week: state.experiments_this_week,
            max_experiments_per_week: self.config.experiments.max_experiments_per_week,
            total_experiments: state.total_experiments,
            total_revenue_lift: state.total_revenue_lift,
            queue_depth,
            last_optimization_at: state.last_optimization_at,
            active_experiment,
        })
    }

    /// Purge analytics events beyond the retention horizon
    pub async fn cleanup_events(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        self.metrics.purge_events_before(cutoff).await
    }

    async fn arms_of(&self, experiment_id: Uuid) -> Result<(Variant, Variant)> {
        let variants = self.store.variants_of(experiment_id).await?;
        let control = variants
            .iter()
            .find(|v| v.is_control)
            .cloned()
            .ok_or_else(|| {
                OptimizerError::NotFound(format!("control variant of experiment {experiment_id}"))
            })?;
        let treatment = variants
            .iter()
            .find(|v| !v.is_control)
            .cloned()
            .ok_or_else(|| {
                OptimizerError::NotFound(format!("treatment variant of experiment {experiment_id}"))
            })?;
        Ok((control, treatment))
    }

    /// Pull fresh metrics for one arm and persist the counts
    async fn refresh_arm(&self, variant: &Variant) -> Result<ArmObservations> {
        let m = self.metrics.variant_metrics(variant.id).await?;
        self.store
            .update_variant_stats(variant.id, m.visitors, m.conversions, m.revenue)
            .await?;
        Ok(ArmObservations::new(m.visitors, m.conversions, m.revenue))
    }

    async fn delete_treatment_artifact(
        &self,
        restaurant_id: &str,
        treatment: &Variant,
    ) -> Result<()> {
        self.publisher
            .delete_variant(restaurant_id, treatment.id)
            .await
    }

    async fn record_learning(
        &self,
        experiment: &Experiment,
        outcome: LearningOutcome,
        detail: String,
    ) -> Result<()> {
        self.store
            .append_learning(
                &experiment.restaurant_id,
                Learning {
                    experiment_id: experiment.id,
                    outcome,
                    hypothesis: experiment.hypothesis.clone(),
                    change_type: experiment.change_type,
                    detail,
                    recorded_at: Utc::now(),
                },
            )
            .await
    }
}

fn arm_observations(variant: &Variant) -> ArmObservations {
    ArmObservations::new(variant.visitors, variant.conversions, variant.revenue)
}
