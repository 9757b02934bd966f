//! Error types shared by the schedulers, models and pipelines.
use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Model weights or another required file could not be found.
    #[error("missing artifact: {}", path.display())]
    MissingArtifact { path: PathBuf },

    /// Rejected before any computation starts.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The latents stopped being finite after the given denoising step.
    #[error("non-finite latents after denoising step {timestep}")]
    NumericDegenerate { timestep: usize },

    #[error("generation cancelled before timestep {timestep}")]
    Cancelled { timestep: usize },

    #[error("torch: {0}")]
    Torch(#[from] tch::TchError),

    #[error("image encoding: {0}")]
    Image(#[from] image::ImageError),

    /// Opaque failure reported by an emotion estimator.
    #[error("emotion estimation: {0}")]
    Emotion(anyhow::Error),
}
