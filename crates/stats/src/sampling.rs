//! Probability distribution sampling
//!
//! Beta draws back the Thompson Sampling posterior. For concentrated
//! posteriors (`alpha + beta > 30`) a Normal approximation is used for speed;
//! diffuse posteriors compose two Gamma draws. Gamma sampling follows
//! Marsaglia and Tsang's rejection method; Normal sampling is Box-Muller.

use rand::Rng;

use crate::errors::{Result, StatsError};

/// Posterior concentration above which the Normal approximation to the
/// Beta distribution is used
const BETA_NORMAL_APPROX_THRESHOLD: f64 = 30.0;

/// Draw from a Normal(mean, std) via the Box-Muller transform
pub fn sample_normal<R: Rng + ?Sized>(mean: f64, std: f64, rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    mean + std * z
}

/// Draw from a Gamma(shape, scale) distribution
///
/// Uses Marsaglia-Tsang rejection sampling for `shape >= 1`; smaller shapes
/// are boosted by one and corrected with `U^(1/shape)`.
pub fn sample_gamma<R: Rng + ?Sized>(shape: f64, scale: f64, rng: &mut R) -> Result<f64> {
    if shape <= 0.0 || scale <= 0.0 {
        return Err(StatsError::InvalidParameter(format!(
            "gamma requires positive shape and scale, got shape={shape}, scale={scale}"
        )));
    }

    if shape < 1.0 {
        let boosted = sample_gamma(shape + 1.0, scale, rng)?;
        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        return Ok(boosted * u.powf(1.0 / shape));
    }

    let d = shape - 1.0 / 3.0;
    let c = 1.0 / (9.0 * d).sqrt();

    loop {
        let x = sample_normal(0.0, 1.0, rng);
        let v = (1.0 + c * x).powi(3);
        if v <= 0.0 {
            continue;
        }

        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
        // Squeeze test first, log test as fallback
        if u < 1.0 - 0.0331 * x.powi(4)
            || u.ln() < 0.5 * x * x + d - d * v + d * v.ln()
        {
            return Ok(d * v * scale);
        }
    }
}

/// Draw from a Beta(alpha, beta) distribution
pub fn sample_beta<R: Rng + ?Sized>(alpha: f64, beta: f64, rng: &mut R) -> Result<f64> {
    if alpha <= 0.0 || beta <= 0.0 {
        return Err(StatsError::InvalidParameter(format!(
            "beta requires positive parameters, got alpha={alpha}, beta={beta}"
        )));
    }

    let total = alpha + beta;
    if total > BETA_NORMAL_APPROX_THRESHOLD {
        let mean = alpha / total;
        let variance = (alpha * beta) / (total * total * (total + 1.0));
        let draw = sample_normal(mean, variance.sqrt(), rng);
        return Ok(draw.clamp(0.0, 1.0));
    }

    let x = sample_gamma(alpha, 1.0, rng)?;
    let y = sample_gamma(beta, 1.0, rng)?;
    Ok(x / (x + y))
}
