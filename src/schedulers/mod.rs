//! # Noise schedules
//!
//! The schedule fixes how much noise is removed at each reverse step. It is
//! derived once per step count and shared read-only between every request
//! that samples with the same number of steps.
use crate::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub mod ddpm;
pub mod guidance;

/// Offset keeping the cosine curve away from a zero derivative at t = 0.
pub const COSINE_S: f64 = 0.008;
/// Lower bound applied to every beta.
pub const MIN_BETA: f64 = 0.001;
/// Upper bound applied to every beta.
pub const MAX_BETA: f64 = 0.02;
/// Largest supported number of diffusion timesteps.
pub const MAX_TIMESTEPS: usize = 10_000;

/// Create a beta schedule that discretizes the cosine alpha_bar function over
/// `num_diffusion_timesteps + 1` equally spaced points, normalized so that
/// `alpha_bar(0) = 1`.
///
/// Betas are clamped into `[MIN_BETA, MAX_BETA]`: both ends of the cosine
/// curve otherwise produce betas that yield degenerate variances.
pub(crate) fn cosine_betas(num_diffusion_timesteps: usize, s: f64) -> Vec<f64> {
    let n = num_diffusion_timesteps as f64;
    let alpha_bar = |x: usize| {
        f64::cos(((x as f64 / n) + s) / (1. + s) * std::f64::consts::FRAC_PI_2).powi(2)
    };
    let alpha_bar_0 = alpha_bar(0);
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = alpha_bar(i) / alpha_bar_0;
            let t2 = alpha_bar(i + 1) / alpha_bar_0;
            (1. - t2 / t1).clamp(MIN_BETA, MAX_BETA)
        })
        .collect()
}

/// Per-timestep coefficients of the reverse diffusion process.
///
/// All the series have the same length, indexed from 0 (least noisy) to
/// `len - 1` (pure noise).
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    sqrt_alphas_cumprod: Vec<f64>,
    sqrt_one_minus_alphas_cumprod: Vec<f64>,
}

impl NoiseSchedule {
    /// Builds the clamped cosine schedule for `num_timesteps` steps.
    pub fn cosine(num_timesteps: usize) -> Result<Self> {
        if num_timesteps == 0 || num_timesteps > MAX_TIMESTEPS {
            return Err(Error::InvalidConfiguration(format!(
                "the number of diffusion timesteps must be in 1..={MAX_TIMESTEPS}, \
                 got {num_timesteps}"
            )));
        }
        let betas = cosine_betas(num_timesteps, COSINE_S);
        let alphas_cumprod: Vec<f64> = betas
            .iter()
            .scan(1f64, |prod, beta| {
                *prod *= 1. - beta;
                Some(*prod)
            })
            .collect();
        let sqrt_alphas_cumprod = alphas_cumprod.iter().map(|a| a.sqrt()).collect();
        let sqrt_one_minus_alphas_cumprod =
            alphas_cumprod.iter().map(|a| (1. - a).sqrt()).collect();
        Ok(Self { betas, alphas_cumprod, sqrt_alphas_cumprod, sqrt_one_minus_alphas_cumprod })
    }

    pub fn len(&self) -> usize {
        self.betas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.betas.is_empty()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn sqrt_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_alphas_cumprod
    }

    pub fn sqrt_one_minus_alphas_cumprod(&self) -> &[f64] {
        &self.sqrt_one_minus_alphas_cumprod
    }
}

static SCHEDULES: Lazy<Mutex<HashMap<usize, Arc<NoiseSchedule>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns the cosine schedule for `num_timesteps`, computing it on first
/// use. Cached schedules are never mutated.
pub fn cached_schedule(num_timesteps: usize) -> Result<Arc<NoiseSchedule>> {
    let mut schedules = SCHEDULES.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(schedule) = schedules.get(&num_timesteps) {
        return Ok(schedule.clone());
    }
    let schedule = Arc::new(NoiseSchedule::cosine(num_timesteps)?);
    tracing::debug!(num_timesteps, "built cosine noise schedule");
    schedules.insert(num_timesteps, schedule.clone());
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_schedule_invariants() {
        for n in [1, 2, 10, 50, 1000] {
            let schedule = NoiseSchedule::cosine(n).unwrap();
            assert_eq!(schedule.len(), n);
            assert_eq!(schedule.alphas_cumprod().len(), n);
            assert_eq!(schedule.sqrt_alphas_cumprod().len(), n);
            assert_eq!(schedule.sqrt_one_minus_alphas_cumprod().len(), n);
            for &beta in schedule.betas() {
                assert!((MIN_BETA..=MAX_BETA).contains(&beta), "beta {beta} out of range");
            }
            for w in schedule.alphas_cumprod().windows(2) {
                assert!(w[1] <= w[0]);
            }
        }
    }

    #[test]
    fn clamp_reaches_both_bounds() {
        let betas = NoiseSchedule::cosine(1000).unwrap().betas().to_vec();
        assert_eq!(betas[0], MIN_BETA);
        assert_eq!(betas[999], MAX_BETA);
        // A single step covers the whole cosine curve.
        assert_eq!(NoiseSchedule::cosine(1).unwrap().betas(), &[MAX_BETA]);
    }

    #[test]
    fn derived_series() {
        let schedule = NoiseSchedule::cosine(10).unwrap();
        let mut prod = 1.;
        for i in 0..10 {
            prod *= 1. - schedule.betas()[i];
            assert!((schedule.alphas_cumprod()[i] - prod).abs() < 1e-15);
            let sqrt_a = schedule.sqrt_alphas_cumprod()[i];
            let sqrt_1ma = schedule.sqrt_one_minus_alphas_cumprod()[i];
            assert!((sqrt_a * sqrt_a + sqrt_1ma * sqrt_1ma - 1.).abs() < 1e-12);
        }
    }

    #[test]
    fn out_of_range_timesteps_rejected() {
        assert!(matches!(NoiseSchedule::cosine(0), Err(Error::InvalidConfiguration(_))));
        assert!(cached_schedule(0).is_err());
        let too_many = MAX_TIMESTEPS + 1;
        assert!(matches!(NoiseSchedule::cosine(too_many), Err(Error::InvalidConfiguration(_))));
        assert!(cached_schedule(usize::MAX).is_err());
        assert_eq!(NoiseSchedule::cosine(MAX_TIMESTEPS).unwrap().len(), MAX_TIMESTEPS);
    }

    #[test]
    fn schedules_are_cached() {
        let s1 = cached_schedule(37).unwrap();
        let s2 = cached_schedule(37).unwrap();
        assert!(Arc::ptr_eq(&s1, &s2));
        let s3 = cached_schedule(38).unwrap();
        assert_eq!(s3.len(), 38);
    }
}
