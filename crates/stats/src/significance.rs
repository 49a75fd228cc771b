//! Hypothesis testing and experiment analysis
//!
//! Two-proportion pooled z-test for conversion rates, an approximate
//! two-sample test for revenue per visitor, sample-size planning, and the
//! combined conversion/revenue verdict.
//!
//! The normal CDF uses the Zelen-Severo rational polynomial and the inverse
//! CDF uses Acklam's algorithm. The coefficients are exact by design: they
//! stand in for a special-function library and must stay bit-for-bit stable.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StatsError};
use crate::observations::ArmObservations;

/// Arms eligible to win an experiment
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArmSide {
    Control,
    Treatment,
}

/// Confidence attached to a combined verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WinnerConfidence {
    High,
    Medium,
    Low,
}

/// Conversion-rate analysis of a two-arm experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionAnalysis {
    pub control_rate: f64,
    pub treatment_rate: f64,
    /// z-statistic, positive when the treatment rate is higher
    pub z: f64,
    pub p_value: f64,
    pub significant: bool,
    pub winner: Option<ArmSide>,
    /// (treatment - control) / control, 0.0 when the control rate is zero
    pub relative_lift: f64,
    /// treatment - control
    pub absolute_lift: f64,
    /// Confidence interval for the absolute lift
    pub lift_ci: (f64, f64),
}

/// Conversion analysis extended with revenue signals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevenueAnalysis {
    pub conversion: ConversionAnalysis,
    pub control_rpv: f64,
    pub treatment_rpv: f64,
    pub control_aov: f64,
    pub treatment_aov: f64,
    /// (treatment_rpv - control_rpv) / control_rpv, 0.0 when control RPV is zero
    pub relative_revenue_lift: f64,
    pub revenue_significant: bool,
}

/// Reconciled conversion + revenue verdict
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CombinedVerdict {
    pub winner: Option<ArmSide>,
    pub confidence: WinnerConfidence,
}

/// Visitors required per arm before the revenue test is evaluated
const REVENUE_TEST_MIN_VISITORS: u64 = 30;

/// Pooled two-proportion z-statistic, positive when `p2 > p1`
///
/// Returns 0.0 for degenerate inputs (empty arms or zero pooled variance);
/// callers gate on sample size before acting on the result.
pub fn z_score(p1: f64, p2: f64, n1: u64, n2: u64) -> f64 {
    if n1 == 0 || n2 == 0 {
        return 0.0;
    }

    let n1 = n1 as f64;
    let n2 = n2 as f64;
    let pooled = (p1 * n1 + p2 * n2) / (n1 + n2);
    let se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();

    if se == 0.0 {
        return 0.0;
    }

    (p2 - p1) / se
}

/// Two-tailed p-value for a z-statistic
///
/// Standard normal tail probability via the Zelen-Severo rational polynomial
/// (Abramowitz & Stegun 26.2.17), accurate to about 7.5e-8.
pub fn p_value(z: f64) -> f64 {
    let z_abs = z.abs();
    let t = 1.0 / (1.0 + 0.2316419 * z_abs);
    let d = 0.3989422804014327 * (-z_abs * z_abs / 2.0).exp();
    let poly = t
        * (0.319381530
            + t * (-0.356563782 + t * (1.781477937 + t * (-1.821255978 + t * 1.330274429))));
    (2.0 * d * poly).min(1.0)
}

/// Inverse standard normal CDF via Acklam's rational approximation
pub fn inverse_normal_cdf(p: f64) -> Result<f64> {
    if !(0.0..1.0).contains(&p) || p == 0.0 {
        return Err(StatsError::InvalidParameter(format!(
            "percentile must be in (0, 1), got {p}"
        )));
    }

    // Acklam's coefficients; do not reformat or round.
    const A: [f64; 6] = [
        -3.969683028665376e+01,
        2.209460984245205e+02,
        -2.759285104469687e+02,
        1.383577518672690e+02,
        -3.066479806614716e+01,
        2.506628277459239e+00,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e+01,
        1.615858368580409e+02,
        -1.556989798598866e+02,
        6.680131188771972e+01,
        -1.328068155288572e+01,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-03,
        -3.223964580411365e-01,
        -2.400758277161838e+00,
        -2.549732539343734e+00,
        4.374664141464968e+00,
        2.938163982698783e+00,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-03,
        3.224671290700398e-01,
        2.445134137142996e+00,
        3.754408661907416e+00,
    ];

    const P_LOW: f64 = 0.02425;
    const P_HIGH: f64 = 1.0 - P_LOW;

    let x = if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= P_HIGH {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        let q = (-2.0 * (1.0 - p).ln()).sqrt();
        -(((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };

    Ok(x)
}

/// Required sample size per arm for a two-proportion test
///
/// Standard power-analysis formula: `mde` is the relative improvement over
/// `baseline` the test should be able to detect.
pub fn required_sample_size(baseline: f64, mde: f64, alpha: f64, power: f64) -> Result<u64> {
    if baseline <= 0.0 || baseline >= 1.0 {
        return Err(StatsError::InvalidParameter(
            "baseline rate must be in (0, 1)".to_string(),
        ));
    }
    if alpha <= 0.0 || alpha >= 1.0 || power <= 0.0 || power >= 1.0 {
        return Err(StatsError::InvalidParameter(
            "alpha and power must be in (0, 1)".to_string(),
        ));
    }

    let p2 = baseline * (1.0 + mde);
    if p2 >= 1.0 {
        return Err(StatsError::InvalidParameter(
            "effect size too large, treatment rate would exceed 1.0".to_string(),
        ));
    }

    let z_alpha = inverse_normal_cdf(1.0 - alpha / 2.0)?;
    let z_beta = inverse_normal_cdf(power)?;

    let p_avg = (baseline + p2) / 2.0;
    let delta = (p2 - baseline).abs();
    if delta == 0.0 {
        return Err(StatsError::InvalidParameter(
            "minimum detectable effect must be nonzero".to_string(),
        ));
    }

    let n = ((z_alpha + z_beta).powi(2) * 2.0 * p_avg * (1.0 - p_avg)) / delta.powi(2);
    Ok(n.ceil() as u64)
}

/// Analyze a two-arm experiment's conversion rates
pub fn analyze_experiment(
    control: &ArmObservations,
    treatment: &ArmObservations,
    confidence_level: f64,
) -> ConversionAnalysis {
    let control_rate = control.conversion_rate();
    let treatment_rate = treatment.conversion_rate();
    let alpha = 1.0 - confidence_level;

    let z = z_score(control_rate, treatment_rate, control.visitors, treatment.visitors);
    let p = p_value(z);
    let significant = control.visitors > 0 && treatment.visitors > 0 && p < alpha;

    let winner = if significant {
        if treatment_rate > control_rate {
            Some(ArmSide::Treatment)
        } else {
            Some(ArmSide::Control)
        }
    } else {
        None
    };

    let absolute_lift = treatment_rate - control_rate;
    let relative_lift = if control_rate > 0.0 {
        absolute_lift / control_rate
    } else {
        0.0
    };

    // Unpooled standard error for the lift interval
    let lift_ci = if control.visitors > 0 && treatment.visitors > 0 {
        let n1 = control.visitors as f64;
        let n2 = treatment.visitors as f64;
        let se = ((control_rate * (1.0 - control_rate) / n1)
            + (treatment_rate * (1.0 - treatment_rate) / n2))
            .sqrt();
        let z_crit = inverse_normal_cdf(1.0 - alpha / 2.0).unwrap_or(1.96);
        (absolute_lift - z_crit * se, absolute_lift + z_crit * se)
    } else {
        (0.0, 0.0)
    };

    ConversionAnalysis {
        control_rate,
        treatment_rate,
        z,
        p_value: p,
        significant,
        winner,
        relative_lift,
        absolute_lift,
        lift_ci,
    }
}

/// Analyze a two-arm experiment's conversion and revenue signals
///
/// The revenue test approximates per-visitor revenue variance as RPV^2/n
/// rather than computing a true sample variance of order values. That is a
/// known simplification carried over deliberately; both arms need at least
/// 30 visitors before the test is evaluated.
pub fn analyze_with_revenue(
    control: &ArmObservations,
    treatment: &ArmObservations,
    confidence_level: f64,
) -> RevenueAnalysis {
    let conversion = analyze_experiment(control, treatment, confidence_level);

    let control_rpv = control.revenue_per_visitor();
    let treatment_rpv = treatment.revenue_per_visitor();
    let relative_revenue_lift = if control_rpv > 0.0 {
        (treatment_rpv - control_rpv) / control_rpv
    } else {
        0.0
    };

    let revenue_significant = if control.visitors >= REVENUE_TEST_MIN_VISITORS
        && treatment.visitors >= REVENUE_TEST_MIN_VISITORS
    {
        let se = (control_rpv.powi(2) / control.visitors as f64
            + treatment_rpv.powi(2) / treatment.visitors as f64)
            .sqrt();
        if se > 0.0 {
            let alpha = 1.0 - confidence_level;
            let z_crit = inverse_normal_cdf(1.0 - alpha / 2.0).unwrap_or(1.96);
            ((treatment_rpv - control_rpv) / se).abs() > z_crit
        } else {
            false
        }
    } else {
        false
    };

    RevenueAnalysis {
        conversion,
        control_rpv,
        treatment_rpv,
        control_aov: control.average_order_value(),
        treatment_aov: treatment.average_order_value(),
        relative_revenue_lift,
        revenue_significant,
    }
}

/// Reconcile the conversion verdict with the revenue signal
///
/// Priority order: agreement between both signals wins with high confidence;
/// a significant revenue signal overrides a missing or contradicting
/// conversion verdict with medium confidence; a lone conversion verdict
/// stands with medium confidence; otherwise there is no winner.
pub fn combined_winner(
    conversion: &ConversionAnalysis,
    revenue_lift: f64,
    revenue_significant: bool,
) -> CombinedVerdict {
    let revenue_side = if revenue_lift > 0.0 {
        ArmSide::Treatment
    } else {
        ArmSide::Control
    };

    match conversion.winner {
        Some(winner) => {
            let agrees = match winner {
                ArmSide::Treatment => revenue_lift > 0.0,
                ArmSide::Control => revenue_lift < 0.0,
            };

            if agrees {
                CombinedVerdict {
                    winner: Some(winner),
                    confidence: WinnerConfidence::High,
                }
            } else if revenue_significant {
                CombinedVerdict {
                    winner: Some(revenue_side),
                    confidence: WinnerConfidence::Medium,
                }
            } else {
                CombinedVerdict {
                    winner: Some(winner),
                    confidence: WinnerConfidence::Medium,
                }
            }
        }
        None => {
            if revenue_significant {
                CombinedVerdict {
                    winner: Some(revenue_side),
                    confidence: WinnerConfidence::Medium,
                }
            } else {
                CombinedVerdict {
                    winner: None,
                    confidence: WinnerConfidence::Low,
                }
            }
        }
    }
}
