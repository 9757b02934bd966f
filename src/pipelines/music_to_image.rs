//! Music to image generation.
//!
//! The emotion carried by an audio clip, as a (valence, arousal) pair, is used
//! to condition a DDPM sampling loop over a cosine noise schedule. The final
//! latents are mapped back to an 8-bit RGB image.
use super::{GenerationControl, GenerationResponse};
use crate::models::emotion_unet::{EmotionUNetConfig, LazyUNet};
use crate::models::{Conditioning, EmotionEstimator, NoisePredictor};
use crate::schedulers::ddpm::DDPMScheduler;
use crate::schedulers::guidance::GuidanceScale;
use crate::schedulers::MAX_TIMESTEPS;
use crate::utils::{png_data_uri, randn};
use crate::{Error, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone)]
pub struct MusicToImageConfig {
    pub width: i64,
    pub height: i64,
    pub channels: i64,
    /// Classifier-free guidance scale, 1 disables guidance.
    pub guidance_scale: f64,
    /// Number of diffusion steps, each one runs the noise predictor once or
    /// twice depending on the guidance scale.
    pub n_steps: usize,
    /// Seed of the request generator, drawn from the OS when not set.
    pub seed: Option<u64>,
}

impl Default for MusicToImageConfig {
    fn default() -> Self {
        Self {
            width: 128,
            height: 128,
            channels: 3,
            guidance_scale: 5.0,
            n_steps: 1000,
            seed: None,
        }
    }
}

impl MusicToImageConfig {
    fn validate(&self) -> Result<GuidanceScale> {
        if self.width <= 0 || self.height <= 0 || self.channels <= 0 {
            return Err(Error::InvalidConfiguration(format!(
                "invalid image shape {}x{}x{}",
                self.channels, self.height, self.width
            )));
        }
        if self.n_steps == 0 || self.n_steps > MAX_TIMESTEPS {
            return Err(Error::InvalidConfiguration(format!(
                "the number of diffusion steps must be in 1..={MAX_TIMESTEPS}, got {}",
                self.n_steps
            )));
        }
        GuidanceScale::new(self.guidance_scale)
    }

    fn latents_shape(&self) -> [i64; 4] {
        [1, self.channels, self.height, self.width]
    }
}

fn all_finite(xs: &Tensor) -> Result<bool> {
    Ok(xs.isfinite().all().f_int64_value(&[])? != 0)
}

/// Runs the reverse diffusion process from pure noise and returns the final
/// latents, of shape `(1, channels, height, width)`.
///
/// Every step depends on the previous one. A step producing non-finite values
/// aborts the generation, as does a cancellation through `control`.
pub fn sample<P: NoisePredictor + ?Sized>(
    predictor: &P,
    conditioning: Conditioning,
    config: &MusicToImageConfig,
    control: &GenerationControl,
    device: Device,
) -> Result<Tensor> {
    let guidance_scale = config.validate()?;
    let shape = config.latents_shape();
    predictor.check_latents_shape(&shape)?;
    let scheduler = DDPMScheduler::new(config.n_steps)?;
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let _no_grad_guard = tch::no_grad_guard();
    let latents = randn(&mut rng, &shape, device) * scheduler.init_noise_sigma();
    control.set_completed_steps(0);
    let n_steps = scheduler.timesteps().len();
    tracing::debug!(guidance_scale = guidance_scale.value(), n_steps, "sampling");
    scheduler.timesteps().iter().enumerate().try_fold(latents, |latents, (index, &timestep)| {
        if control.is_cancelled() {
            return Err(Error::Cancelled { timestep });
        }
        let noise_pred = guidance_scale.predict(predictor, &latents, timestep, conditioning);
        let latents = scheduler.step(&noise_pred, timestep, &latents, &mut rng);
        if !all_finite(&latents)? {
            return Err(Error::NumericDegenerate { timestep });
        }
        control.set_completed_steps(index + 1);
        if (index + 1) % 100 == 0 {
            tracing::debug!(step = index + 1, n_steps, "denoising");
        }
        Ok(latents)
    })
}

/// Maps latents in roughly `[-1, 1]` to a `(channels, height, width)` uint8
/// image. Values out of range are clamped.
pub fn postprocess(latents: &Tensor) -> Tensor {
    let latents = if latents.dim() == 4 { latents.get(0) } else { latents.shallow_clone() };
    let image = (latents * 0.5 + 0.5).clamp(0., 1.).to_device(Device::Cpu);
    (image * 255.).to_kind(Kind::Uint8)
}

/// Generates an image for valence and arousal given on the `0..=9` scale.
pub fn generate_image<P: NoisePredictor + ?Sized>(
    predictor: &P,
    valence: f64,
    arousal: f64,
    config: &MusicToImageConfig,
    control: &GenerationControl,
    device: Device,
) -> Result<Tensor> {
    let conditioning = Conditioning::from_scale(valence, arousal)?;
    tracing::info!(
        valence,
        arousal,
        guidance_scale = config.guidance_scale,
        n_steps = config.n_steps,
        seed = ?config.seed,
        ?device,
        "generating image"
    );
    let latents = sample(predictor, conditioning, config, control, device)?;
    Ok(postprocess(&latents))
}

/// Estimates the emotion of an audio clip and renders the matching image.
pub fn generate_from_audio<E, P>(
    estimator: &E,
    predictor: &P,
    audio_path: &Path,
    config: &MusicToImageConfig,
    control: &GenerationControl,
    device: Device,
) -> Result<GenerationResponse>
where
    E: EmotionEstimator + ?Sized,
    P: NoisePredictor + ?Sized,
{
    let (valence, arousal) = estimator.estimate_emotion(audio_path).map_err(Error::Emotion)?;
    let image = generate_image(predictor, valence, arousal, config, control, device)?;
    Ok(GenerationResponse::Image { valence, arousal, image: png_data_uri(&image)? })
}

/// The music-to-image service: a lazily loaded UNet shared by all requests.
#[derive(Debug)]
pub struct MusicToImagePipeline {
    unet: LazyUNet,
    pub config: MusicToImageConfig,
}

impl MusicToImagePipeline {
    pub fn new<P: Into<PathBuf>>(
        unet_weights: P,
        unet_config: EmotionUNetConfig,
        config: MusicToImageConfig,
        device: Device,
    ) -> Self {
        Self { unet: LazyUNet::new(unet_weights, unet_config, device), config }
    }

    pub fn generate_image(
        &self,
        valence: f64,
        arousal: f64,
        control: &GenerationControl,
    ) -> Result<Tensor> {
        let unet = self.unet.get()?;
        generate_image(unet, valence, arousal, &self.config, control, self.unet.device())
    }

    /// Handles one upload. Failures are reported in the response so that a
    /// bad request never takes down the others.
    pub fn respond<E: EmotionEstimator + ?Sized>(
        &self,
        estimator: &E,
        audio_path: &Path,
        control: &GenerationControl,
    ) -> GenerationResponse {
        let response = self.unet.get().and_then(|unet| {
            generate_from_audio(
                estimator,
                unet,
                audio_path,
                &self.config,
                control,
                self.unet.device(),
            )
        });
        response.unwrap_or_else(|err| {
            tracing::warn!(audio = %audio_path.display(), %err, "music to image failed");
            GenerationResponse::Error { error: err.to_string() }
        })
    }
}
