//! Configuration management for the site A/B-testing optimizer

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    LoadError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Scheduler timers and pacing
    pub scheduler: SchedulerConfig,

    /// Experiment decision parameters
    pub experiments: ExperimentConfig,

    /// Anomaly detection thresholds
    pub anomaly: AnomalyConfig,
}

impl OptimizerConfig {
    /// Load configuration from file and environment
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        // Override with environment variables (prefixed with SITEOPT_)
        figment = figment.merge(Env::prefixed("SITEOPT_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| ConfigError::LoadError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let exp = &self.experiments;

        if exp.confidence_level <= 0.0 || exp.confidence_level >= 1.0 {
            return Err(ConfigError::ValidationError(
                "confidence_level must be in (0, 1)".to_string(),
            ));
        }

        if exp.exploration_floor <= 0.0 || exp.exploration_floor * 2.0 >= 1.0 {
            return Err(ConfigError::ValidationError(
                "exploration_floor must leave room for two variants".to_string(),
            ));
        }

        if exp.thompson_samples == 0 {
            return Err(ConfigError::ValidationError(
                "thompson_samples must be greater than 0".to_string(),
            ));
        }

        if exp.min_sample_size == 0 {
            return Err(ConfigError::ValidationError(
                "min_sample_size must be greater than 0".to_string(),
            ));
        }

        if exp.max_experiments_per_week == 0 {
            return Err(ConfigError::ValidationError(
                "max_experiments_per_week must be at least 1".to_string(),
            ));
        }

        if exp.futility_p_value <= 0.0 || exp.futility_p_value > 1.0 {
            return Err(ConfigError::ValidationError(
                "futility_p_value must be in (0, 1]".to_string(),
            ));
        }

        let sched = &self.scheduler;
        if sched.optimization_interval_secs == 0
            || sched.cleanup_interval_secs == 0
            || sched.weekly_reset_poll_secs == 0
        {
            return Err(ConfigError::ValidationError(
                "scheduler intervals must be greater than 0".to_string(),
            ));
        }

        if sched.per_restaurant_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "per_restaurant_timeout_secs must be greater than 0".to_string(),
            ));
        }

        let anomaly = &self.anomaly;
        if anomaly.z_threshold >= 0.0 {
            return Err(ConfigError::ValidationError(
                "anomaly z_threshold must be negative (one-tailed drop)".to_string(),
            ));
        }

        if anomaly.critical_drop_ratio <= 0.0 || anomaly.critical_drop_ratio >= 1.0 {
            return Err(ConfigError::ValidationError(
                "critical_drop_ratio must be in (0, 1)".to_string(),
            ));
        }

        if anomaly.treatment_floor_ratio <= 0.0 || anomaly.treatment_floor_ratio >= 1.0 {
            return Err(ConfigError::ValidationError(
                "treatment_floor_ratio must be in (0, 1)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Optimization cycle interval in seconds
    pub optimization_interval_secs: u64,

    /// Delay before the first cycle after startup
    pub startup_delay_secs: u64,

    /// Pause between restaurants within a cycle, keeps downstream APIs happy
    pub inter_restaurant_delay_secs: u64,

    /// Upper bound on a single restaurant's cycle; a hung external call
    /// must not stall the whole batch
    pub per_restaurant_timeout_secs: u64,

    /// Retention cleanup interval in seconds
    pub cleanup_interval_secs: u64,

    /// Analytics event retention horizon in days
    pub retention_days: i64,

    /// Weekly reset poll interval in seconds
    pub weekly_reset_poll_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            optimization_interval_secs: 14_400, // 4 hours
            startup_delay_secs: 30,
            inter_restaurant_delay_secs: 2,
            per_restaurant_timeout_secs: 120,
            cleanup_interval_secs: 86_400, // 24 hours
            retention_days: 90,
            weekly_reset_poll_secs: 3_600,
        }
    }
}

/// Experiment decision parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Minimum visitors per arm before any verdict
    pub min_sample_size: u64,

    /// Confidence level for significance tests (e.g., 0.95)
    pub confidence_level: f64,

    /// Monte Carlo draws for Thompson Sampling win probabilities
    pub thompson_samples: usize,

    /// Guaranteed traffic share per arm regardless of win probability
    pub exploration_floor: f64,

    /// Weekly cap on new experiments per restaurant
    pub max_experiments_per_week: u32,

    /// Replenish the hypothesis queue when it drops below this depth
    pub min_queue_depth: usize,

    /// Candidates requested per replenishment call
    pub queue_refill_batch: usize,

    /// Pageviews required in the trailing 14 days before generating hypotheses
    pub min_pageviews_for_hypotheses: u64,

    /// Historical visitors required (trailing 30 days) before refreshing
    /// the baseline snapshot
    pub min_baseline_visitors: u64,

    /// Futility kicks in after this multiple of min_sample_size per arm
    pub futility_multiplier: u64,

    /// Futility requires the p-value to exceed this
    pub futility_p_value: f64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 100,
            confidence_level: 0.95,
            thompson_samples: 10_000,
            exploration_floor: 0.10,
            max_experiments_per_week: 3,
            min_queue_depth: 5,
            queue_refill_batch: 5,
            min_pageviews_for_hypotheses: 50,
            min_baseline_visitors: 100,
            futility_multiplier: 4,
            futility_p_value: 0.5,
        }
    }
}

/// Anomaly detection thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Minimum sample size before anomaly detection activates
    pub min_sample_size: u64,

    /// One-tailed z threshold for flagging a conversion-rate drop (~99%)
    pub z_threshold: f64,

    /// Relative drop beyond which an anomaly is critical
    pub critical_drop_ratio: f64,

    /// Pause the experiment when the treatment rate falls below this
    /// fraction of the historical baseline
    pub treatment_floor_ratio: f64,

    /// Treatment visitors required before the floor check applies
    pub treatment_min_visitors: u64,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 50,
            z_threshold: -2.33,
            critical_drop_ratio: 0.50,
            treatment_floor_ratio: 0.30,
            treatment_min_visitors: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OptimizerConfig::default();
        assert!(config.validate().is_ok());

        assert_eq!(config.experiments.min_sample_size, 100);
        assert_eq!(config.experiments.max_experiments_per_week, 3);
        assert_eq!(config.scheduler.optimization_interval_secs, 14_400);
        assert_eq!(config.anomaly.z_threshold, -2.33);
    }

    #[test]
    fn test_invalid_confidence_rejected() {
        let mut config = OptimizerConfig::default();
        config.experiments.confidence_level = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_floor_rejected() {
        let mut config = OptimizerConfig::default();
        config.experiments.exploration_floor = 0.6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_positive_anomaly_threshold_rejected() {
        let mut config = OptimizerConfig::default();
        config.anomaly.z_threshold = 2.33;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_override() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SITEOPT_EXPERIMENTS__MAX_EXPERIMENTS_PER_WEEK", "5");
            let config = OptimizerConfig::load(None).expect("load");
            assert_eq!(config.experiments.max_experiments_per_week, 5);
            Ok(())
        });
    }
}
