//! # Models
//!
//! The sampling loop only sees models through two seams: a [`NoisePredictor`]
//! that estimates the noise present in a latent, and an [`EmotionEstimator`]
//! that turns an audio clip into the conditioning signal.
use crate::{Error, Result};
use std::path::Path;
use tch::Tensor;

pub mod attention;
pub mod embeddings;
pub mod emotion_unet;

/// Upper end of the valence/arousal scale used by emotion estimators.
pub const EMOTION_SCALE: f64 = 9.0;

/// Normalized (valence, arousal) pair fed to every denoising step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conditioning {
    pub valence: f64,
    pub arousal: f64,
}

impl Conditioning {
    /// Normalizes values given on the `0..=EMOTION_SCALE` scale.
    pub fn from_scale(valence: f64, arousal: f64) -> Result<Self> {
        if !valence.is_finite() || !arousal.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "conditioning must be finite, got valence {valence} and arousal {arousal}"
            )));
        }
        Ok(Self { valence: valence / EMOTION_SCALE, arousal: arousal / EMOTION_SCALE })
    }

    /// The conditioning used for unconditioned predictions.
    pub fn zeros() -> Self {
        Self { valence: 0., arousal: 0. }
    }
}

/// Predicts the noise contained in `latents` at a given timestep.
///
/// Implementations must accept [`Conditioning::zeros`] and are expected to be
/// deterministic for identical inputs.
pub trait NoisePredictor {
    fn predict_noise(&self, latents: &Tensor, timestep: usize, conditioning: Conditioning)
        -> Tensor;

    /// Rejects latent shapes the predictor cannot process, before sampling
    /// starts. Any shape is accepted by default.
    fn check_latents_shape(&self, _shape: &[i64]) -> Result<()> {
        Ok(())
    }
}

/// Maps an audio clip to (valence, arousal) on the `0..=EMOTION_SCALE` scale.
pub trait EmotionEstimator {
    fn estimate_emotion(&self, audio_path: &Path) -> anyhow::Result<(f64, f64)>;
}
