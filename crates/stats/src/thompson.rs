//! Thompson Sampling win probabilities and traffic allocation
//!
//! Each arm's posterior is Beta(conversions + 1, visitors - conversions + 1).
//! Win probabilities are estimated by Monte Carlo: sample every posterior,
//! count which arm drew highest. Production traffic splits reserve an
//! exploration floor per arm and distribute the remainder proportional to
//! win probability.

use rand::Rng;

use crate::errors::{Result, StatsError};
use crate::observations::ArmObservations;
use crate::sampling::sample_beta;

/// Estimate each arm's probability of being the best arm
///
/// Returns one win fraction per arm, summing to 1.0.
pub fn win_probabilities<R: Rng + ?Sized>(
    arms: &[ArmObservations],
    samples: usize,
    rng: &mut R,
) -> Result<Vec<f64>> {
    if arms.is_empty() {
        return Err(StatsError::InsufficientData(
            "no arms to sample".to_string(),
        ));
    }
    if samples == 0 {
        return Err(StatsError::InvalidParameter(
            "samples must be greater than 0".to_string(),
        ));
    }
    for (i, arm) in arms.iter().enumerate() {
        if arm.conversions > arm.visitors {
            return Err(StatsError::InvalidParameter(format!(
                "arm {i} has more conversions ({}) than visitors ({})",
                arm.conversions, arm.visitors
            )));
        }
    }

    let mut wins = vec![0u64; arms.len()];
    let mut draws = vec![0.0f64; arms.len()];

    for _ in 0..samples {
        for (i, arm) in arms.iter().enumerate() {
            let alpha = arm.conversions as f64 + 1.0;
            let beta = (arm.visitors - arm.conversions) as f64 + 1.0;
            draws[i] = sample_beta(alpha, beta, rng)?;
        }

        let best = draws
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        wins[best] += 1;
    }

    Ok(wins
        .into_iter()
        .map(|w| w as f64 / samples as f64)
        .collect())
}

/// Derive production traffic splits from win probabilities
///
/// Every arm keeps at least `floor` of the traffic; the rest is distributed
/// proportional to win probability. When the floor is infeasible for the arm
/// count, traffic is split equally instead. Output always sums to 1.0.
pub fn traffic_allocation<R: Rng + ?Sized>(
    arms: &[ArmObservations],
    floor: f64,
    samples: usize,
    rng: &mut R,
) -> Result<Vec<f64>> {
    if arms.is_empty() {
        return Err(StatsError::InsufficientData(
            "no arms to allocate".to_string(),
        ));
    }
    if !(0.0..1.0).contains(&floor) {
        return Err(StatsError::InvalidParameter(format!(
            "exploration floor must be in [0, 1), got {floor}"
        )));
    }

    let n = arms.len();
    let reserved = floor * n as f64;
    if reserved >= 1.0 {
        return Ok(vec![1.0 / n as f64; n]);
    }

    let probabilities = win_probabilities(arms, samples, rng)?;
    let remaining = 1.0 - reserved;

    Ok(probabilities
        .into_iter()
        .map(|p| floor + p * remaining)
        .collect())
}
