//! # Music to image diffusion
//!
//! Renders an image matching the emotion of a piece of music. An emotion
//! estimator maps the audio to a (valence, arousal) pair which conditions a
//! denoising diffusion probabilistic model, sampled with classifier-free
//! guidance, using Torch via [tch-rs](https://github.com/LaurentMazare/tch-rs).
//!
//! This library includes:
//! - A clamped cosine noise schedule, cached per number of timesteps.
//! - A DDPM ancestral sampler and classifier-free guidance.
//! - An emotion-conditioned UNet noise predictor.
//! - The sampling loop and the conversion of its output to a PNG image.

pub mod models;
pub mod pipelines;
pub mod schedulers;
pub mod utils;

mod error;

pub use error::{Error, Result};
