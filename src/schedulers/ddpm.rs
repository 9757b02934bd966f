//! # Denoising Diffusion Probabilistic Models
//!
//! Ancestral sampling: each reverse step computes the posterior mean from the
//! predicted noise and, except on the last step, adds fresh gaussian noise
//! scaled by `sqrt(beta_t)`.
//!
//! Denoising Diffusion Probabilistic Models, J. Ho et al, 2020.
//! https://arxiv.org/abs/2006.11239
use super::{cached_schedule, NoiseSchedule};
use crate::utils::randn_like;
use crate::Result;
use rand::Rng;
use std::sync::Arc;
use tch::Tensor;

/// The DDPM scheduler, stepping through every timestep of a cosine schedule.
#[derive(Debug, Clone)]
pub struct DDPMScheduler {
    schedule: Arc<NoiseSchedule>,
    timesteps: Vec<usize>,
}

impl DDPMScheduler {
    /// Creates a scheduler over `num_timesteps` steps, reusing the cached
    /// schedule when one exists.
    pub fn new(num_timesteps: usize) -> Result<Self> {
        let schedule = cached_schedule(num_timesteps)?;
        Ok(Self::from_schedule(schedule))
    }

    pub fn from_schedule(schedule: Arc<NoiseSchedule>) -> Self {
        let timesteps = (0..schedule.len()).rev().collect();
        Self { schedule, timesteps }
    }

    /// Timesteps in sampling order, from `len - 1` down to 0.
    pub fn timesteps(&self) -> &[usize] {
        self.timesteps.as_slice()
    }

    pub fn schedule(&self) -> &NoiseSchedule {
        &self.schedule
    }

    pub fn init_noise_sigma(&self) -> f64 {
        1.
    }

    /// Posterior mean of the previous sample given the predicted noise.
    fn pred_prev_sample(&self, model_output: &Tensor, timestep: usize, sample: &Tensor) -> Tensor {
        let beta_t = self.schedule.betas()[timestep];
        let sqrt_one_minus_alpha_prod_t = self.schedule.sqrt_one_minus_alphas_cumprod()[timestep];
        let sqrt_recip_alpha_t = (1. / (1. - beta_t)).sqrt();
        (sample - model_output * (beta_t / sqrt_one_minus_alpha_prod_t)) * sqrt_recip_alpha_t
    }

    /// Performs a backward step. Timestep 0 is the last one and returns the
    /// mean with no noise added; `rng` is left untouched in that case.
    pub fn step<R: Rng + ?Sized>(
        &self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
        rng: &mut R,
    ) -> Tensor {
        let pred_prev_sample = self.pred_prev_sample(model_output, timestep, sample);
        if timestep == 0 {
            return pred_prev_sample;
        }
        let variance_noise = randn_like(rng, sample);
        pred_prev_sample + variance_noise * self.schedule.betas()[timestep].sqrt()
    }
}
