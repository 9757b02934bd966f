//! # Pipelines
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub mod music_to_image;

/// Handle used to follow and cancel a generation from another thread.
///
/// Cancellation is cooperative: the sampling loop checks it between two
/// timesteps.
#[derive(Debug, Clone, Default)]
pub struct GenerationControl {
    cancelled: Arc<AtomicBool>,
    completed_steps: Arc<AtomicUsize>,
}

impl GenerationControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Number of denoising steps run so far by the current generation.
    pub fn completed_steps(&self) -> usize {
        self.completed_steps.load(Ordering::SeqCst)
    }

    pub(crate) fn set_completed_steps(&self, steps: usize) {
        self.completed_steps.store(steps, Ordering::SeqCst);
    }
}

/// Body returned to callers of the music-to-image endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum GenerationResponse {
    Image {
        valence: f64,
        arousal: f64,
        /// `data:image/png;base64,...`
        image: String,
    },
    Error {
        error: String,
    },
}
