//! Background scheduling of optimization cycles
//!
//! Three independent loops: the optimization loop walks every enabled
//! restaurant each interval, the cleanup loop purges analytics events past
//! the retention horizon, and the weekly-reset loop rolls rate-limit
//! counters at the Sunday boundary. Each loop owns its own task; a slow or
//! failing loop never stalls the others.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use site_optimizer_config::SchedulerConfig;
use site_optimizer_types::week_start_sunday;

use crate::optimizer::{ABOptimizer, OptimizeOutcome};
use crate::traits::ExperimentStore;

/// Periodic driver for the optimizer
pub struct Scheduler {
    optimizer: Arc<ABOptimizer>,
    store: Arc<dyn ExperimentStore>,
    config: SchedulerConfig,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        optimizer: Arc<ABOptimizer>,
        store: Arc<dyn ExperimentStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            optimizer,
            store,
            config,
            handles: Vec::new(),
        }
    }

    /// Spawn the background loops
    ///
    /// Idempotent start is not supported; call once. The loops run until
    /// `shutdown`.
    pub fn start(&mut self) {
        info!(
            interval_secs = self.config.optimization_interval_secs,
            "starting optimizer scheduler"
        );

        self.handles.push(tokio::spawn(optimization_loop(
            self.optimizer.clone(),
            self.store.clone(),
            self.config.clone(),
        )));
        self.handles.push(tokio::spawn(cleanup_loop(
            self.optimizer.clone(),
            self.config.clone(),
        )));
        self.handles.push(tokio::spawn(weekly_reset_loop(
            self.store.clone(),
            self.config.clone(),
        )));
    }

    /// Abort all background loops
    pub fn shutdown(&mut self) {
        info!("stopping optimizer scheduler");
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Walk every enabled restaurant once per interval
///
/// Restaurants are processed sequentially with a small delay between them
/// so that downstream collaborators (metrics aggregation, variant
/// generation) see a smeared load rather than a thundering herd. A single
/// restaurant is bounded by the per-restaurant timeout; one that hangs
/// costs its slot, not the whole cycle.
async fn optimization_loop(
    optimizer: Arc<ABOptimizer>,
    store: Arc<dyn ExperimentStore>,
    config: SchedulerConfig,
) {
    sleep(Duration::from_secs(config.startup_delay_secs)).await;

    let mut ticker = interval(Duration::from_secs(config.optimization_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let restaurants = match store.enabled_restaurants().await {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "failed to list enabled restaurants");
                continue;
            }
        };

        debug!(count = restaurants.len(), "optimization cycle starting");

        for restaurant_id in restaurants {
            let budget = Duration::from_secs(config.per_restaurant_timeout_secs);
            match timeout(budget, optimizer.optimize(&restaurant_id)).await {
                Ok(Ok(outcome)) => log_outcome(&restaurant_id, &outcome),
                Ok(Err(e)) => {
                    warn!(restaurant_id, error = %e, "optimization cycle failed")
                }
                Err(_) => {
                    warn!(
                        restaurant_id,
                        timeout_secs = config.per_restaurant_timeout_secs,
                        "optimization cycle timed out"
                    )
                }
            }

            sleep(Duration::from_secs(config.inter_restaurant_delay_secs)).await;
        }
    }
}

fn log_outcome(restaurant_id: &str, outcome: &OptimizeOutcome) {
    match outcome {
        OptimizeOutcome::Disabled => {}
        OptimizeOutcome::Started {
            experiment_id,
            hypothesis,
        } => {
            info!(restaurant_id, %experiment_id, %hypothesis, "experiment started")
        }
        OptimizeOutcome::Continue { experiment_id, .. } => {
            debug!(restaurant_id, %experiment_id, "experiment continuing")
        }
        OptimizeOutcome::Applied {
            experiment_id,
            relative_lift,
            revenue_lift,
            ..
        } => {
            info!(
                restaurant_id,
                %experiment_id,
                relative_lift,
                revenue_lift,
                "winning variant applied"
            )
        }
        OptimizeOutcome::Reverted {
            experiment_id,
            outcome,
        } => {
            info!(restaurant_id, %experiment_id, ?outcome, "experiment reverted")
        }
        OptimizeOutcome::Paused {
            experiment_id,
            reason,
        } => {
            warn!(restaurant_id, %experiment_id, %reason, "experiment paused")
        }
        OptimizeOutcome::Skipped { reason } => {
            debug!(restaurant_id, %reason, "cycle skipped")
        }
    }
}

/// Purge analytics events beyond the retention horizon once per interval
async fn cleanup_loop(optimizer: Arc<ABOptimizer>, config: SchedulerConfig) {
    let mut ticker = interval(Duration::from_secs(config.cleanup_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match optimizer.cleanup_events(config.retention_days).await {
            Ok(purged) => {
                if purged > 0 {
                    info!(purged, retention_days = config.retention_days, "purged old events");
                }
            }
            Err(e) => error!(error = %e, "event cleanup failed"),
        }
    }
}

/// Roll weekly experiment counters at the Sunday 00:00 UTC boundary
///
/// The store's slot reservation already rolls a restaurant's counter lazily
/// on its next optimization; this loop sweeps the rest so that status
/// queries on idle restaurants also report the fresh week.
async fn weekly_reset_loop(store: Arc<dyn ExperimentStore>, config: SchedulerConfig) {
    let mut last_applied = week_start_sunday(chrono::Utc::now());
    let mut ticker = interval(Duration::from_secs(config.weekly_reset_poll_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let current = week_start_sunday(chrono::Utc::now());
        if current > last_applied {
            match store.reset_weekly_counts(current).await {
                Ok(reset) => {
                    info!(reset, week_start = %current, "weekly experiment counters reset");
                    last_applied = current;
                }
                Err(e) => error!(error = %e, "weekly counter reset failed"),
            }
        }
    }
}
