//! Conversion-rate anomaly detection and the experiment pause policy
//!
//! An anomaly in the control arm signals an external cause unrelated to the
//! experiment; an anomaly in the treatment arm signals a variant actively
//! hurting conversions. Either way production traffic is at risk and the
//! experiment must stop before significance would normally trigger.

use serde::{Deserialize, Serialize};

use crate::observations::ArmObservations;

/// Thresholds for anomaly detection; defaults mirror the production values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyThresholds {
    /// Minimum visitors before detection activates
    pub min_sample_size: u64,
    /// One-tailed z threshold (~99% one-tailed at -2.33)
    pub z_threshold: f64,
    /// Relative drop beyond which an anomaly is critical
    pub critical_drop_ratio: f64,
    /// Pause when the treatment rate falls below this fraction of baseline
    pub treatment_floor_ratio: f64,
    /// Treatment visitors required before the floor check applies
    pub treatment_min_visitors: u64,
}

impl Default for AnomalyThresholds {
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

/// Severity of a detected anomaly
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Warning,
    Critical,
}

/// Result of an anomaly check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyCheck {
    pub is_anomaly: bool,
    /// One-tailed z of the current rate against the historical baseline
    pub z: f64,
    /// (historical - current) / historical
    pub relative_drop: f64,
    pub severity: Option<AnomalySeverity>,
}

impl AnomalyCheck {
    fn normal(z: f64, relative_drop: f64) -> Self {
        Self {
            is_anomaly: false,
            z,
            relative_drop,
            severity: None,
        }
    }
}

/// Pause verdict for a running experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseDecision {
    pub should_pause: bool,
    pub reason: Option<String>,
}

impl PauseDecision {
    fn keep_running() -> Self {
        Self {
            should_pause: false,
            reason: None,
        }
    }

    fn pause(reason: impl Into<String>) -> Self {
        Self {
            should_pause: true,
            reason: Some(reason.into()),
        }
    }
}

/// Check whether a conversion rate has dropped anomalously below its baseline
///
/// Requires at least `min_sample_size` visitors and a positive historical
/// rate; below that the check reports normal. The z-statistic uses the
/// historical rate's binomial standard error, one-tailed: only drops count.
pub fn detect_anomaly(
    current_rate: f64,
    historical_rate: f64,
    sample_size: u64,
    thresholds: &AnomalyThresholds,
) -> AnomalyCheck {
    if sample_size < thresholds.min_sample_size || historical_rate <= 0.0 {
        return AnomalyCheck::normal(0.0, 0.0);
    }

    let se = (historical_rate * (1.0 - historical_rate) / sample_size as f64).sqrt();
    if se == 0.0 {
        return AnomalyCheck::normal(0.0, 0.0);
    }

    let z = (current_rate - historical_rate) / se;
    let relative_drop = (historical_rate - current_rate) / historical_rate;

    if z < thresholds.z_threshold {
        let severity = if relative_drop > thresholds.critical_drop_ratio {
            AnomalySeverity::Critical
        } else {
            AnomalySeverity::Warning
        };
        AnomalyCheck {
            is_anomaly: true,
            z,
            relative_drop,
            severity: Some(severity),
        }
    } else {
        AnomalyCheck::normal(z, relative_drop)
    }
}

/// Decide whether a running experiment must be paused
///
/// Two independent triggers:
/// - a critical anomaly in the control arm (external cause, the experiment's
///   data is no longer trustworthy);
/// - a treatment arm with enough traffic converting below the floor fraction
///   of the historical baseline (catastrophically bad variant).
pub fn should_pause(
    control: &ArmObservations,
    treatment: &ArmObservations,
    historical_rate: f64,
    thresholds: &AnomalyThresholds,
) -> PauseDecision {
    let control_check = detect_anomaly(
        control.conversion_rate(),
        historical_rate,
        control.visitors,
        thresholds,
    );

    if control_check.is_anomaly && control_check.severity == Some(AnomalySeverity::Critical) {
        return PauseDecision::pause(format!(
            "critical conversion anomaly in control arm: rate {:.4} vs baseline {:.4} ({:.0}% drop)",
            control.conversion_rate(),
            historical_rate,
            control_check.relative_drop * 100.0
        ));
    }

    if historical_rate > 0.0
        && treatment.visitors >= thresholds.treatment_min_visitors
        && treatment.conversion_rate() < historical_rate * thresholds.treatment_floor_ratio
    {
        return PauseDecision::pause(format!(
            "treatment converting at {:.4}, below {:.0}% of baseline {:.4}",
            treatment.conversion_rate(),
            thresholds.treatment_floor_ratio * 100.0,
            historical_rate
        ));
    }

    PauseDecision::keep_running()
}
