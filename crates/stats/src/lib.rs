//! Statistical engine for the site A/B-testing optimizer
//!
//! Every operation in this crate is a pure function of its inputs: no hidden
//! state, no I/O. That makes the engine safe to share across concurrent
//! callers and trivial to test in isolation.
//!
//! The normal-CDF and inverse-normal-CDF routines use closed-form rational
//! polynomial approximations instead of a special-function library; their
//! coefficients are load-bearing and must not be "simplified".

pub mod anomaly;
pub mod errors;
pub mod observations;
pub mod sampling;
pub mod significance;
pub mod status;
pub mod thompson;

pub use anomaly::{
    detect_anomaly, should_pause, AnomalyCheck, AnomalySeverity, AnomalyThresholds, PauseDecision,
};
pub use errors::{Result, StatsError};
pub use observations::ArmObservations;
pub use sampling::{sample_beta, sample_gamma, sample_normal};
pub use significance::{
    analyze_experiment, analyze_with_revenue, combined_winner, inverse_normal_cdf, p_value,
    required_sample_size, z_score, ArmSide, CombinedVerdict, ConversionAnalysis, RevenueAnalysis,
    WinnerConfidence,
};
pub use status::{
    check_futility, experiment_status, DecisionThresholds, ExperimentVerdict, Recommendation,
};
pub use thompson::{traffic_allocation, win_probabilities};
