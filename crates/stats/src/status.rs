//! Experiment status decisions: collecting, significant, futile, or running
//!
//! Single entry point combining the significance test with the futility
//! stopping rule. The optimizer acts on the returned verdict; nothing in
//! here mutates state.

use serde::{Deserialize, Serialize};

use crate::observations::ArmObservations;
use crate::significance::{analyze_experiment, ArmSide, ConversionAnalysis};

/// Decision thresholds; defaults mirror the production values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionThresholds {
    /// Minimum visitors per arm before any verdict
    pub min_sample_size: u64,
    /// Confidence level for significance (e.g., 0.95)
    pub confidence_level: f64,
    /// Futility kicks in after this multiple of min_sample_size per arm
    pub futility_multiplier: u64,
    /// Futility requires the p-value to exceed this
    pub futility_p_value: f64,
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            min_sample_size: 100,
            confidence_level: 0.95,
            futility_multiplier: 4,
            futility_p_value: 0.5,
        }
    }
}

/// Recommended next action for a running experiment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Promote the treatment to production
    Apply,
    /// Keep the control; revert the treatment
    Keep,
    /// Stop without a winner
    End,
    /// Keep collecting data
    Continue,
}

/// Verdict on a running experiment
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum ExperimentVerdict {
    /// Below the minimum sample size; no effect size is trusted yet
    Collecting,
    /// Statistically significant result
    Significant {
        winner: ArmSide,
        recommendation: Recommendation,
    },
    /// Continued testing is unlikely to find an effect
    Futile,
    /// Enough data to analyze, no verdict yet
    Running,
}

/// Futility stopping rule
///
/// Once both arms exceed `futility_multiplier x min_sample_size` visitors
/// with a p-value above the threshold, the effect (if any) is negligible or
/// wrong-signed and further traffic is wasted.
pub fn check_futility(
    control: &ArmObservations,
    treatment: &ArmObservations,
    analysis: &ConversionAnalysis,
    thresholds: &DecisionThresholds,
) -> bool {
    let futility_sample = thresholds.min_sample_size * thresholds.futility_multiplier;
    control.visitors > futility_sample
        && treatment.visitors > futility_sample
        && analysis.p_value > thresholds.futility_p_value
}

/// Combined decision entry point for a running experiment
pub fn experiment_status(
    control: &ArmObservations,
    treatment: &ArmObservations,
    thresholds: &DecisionThresholds,
) -> ExperimentVerdict {
    if control.visitors < thresholds.min_sample_size
        || treatment.visitors < thresholds.min_sample_size
    {
        return ExperimentVerdict::Collecting;
    }

    let analysis = analyze_experiment(control, treatment, thresholds.confidence_level);

    if analysis.significant {
        let winner = analysis.winner.unwrap_or(ArmSide::Control);
        let recommendation = match winner {
            ArmSide::Treatment => Recommendation::Apply,
            ArmSide::Control => Recommendation::Keep,
        };
        return ExperimentVerdict::Significant {
            winner,
            recommendation,
        };
    }

    if check_futility(control, treatment, &analysis, thresholds) {
        return ExperimentVerdict::Futile;
    }

    ExperimentVerdict::Running
}
