//! # Classifier-free guidance
//!
//! Blends the conditioned and unconditioned noise predictions,
//! `uncond + scale * (cond - uncond)`. A scale of 1 returns the conditioned
//! prediction as is, and the unconditioned prediction is then never computed.
use crate::models::{Conditioning, NoisePredictor};
use crate::{Error, Result};
use tch::Tensor;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceScale(f64);

impl GuidanceScale {
    pub fn new(scale: f64) -> Result<Self> {
        if !scale.is_finite() || scale < 0. {
            return Err(Error::InvalidConfiguration(format!(
                "guidance scale must be a non-negative number, got {scale}"
            )));
        }
        Ok(Self(scale))
    }

    pub fn value(&self) -> f64 {
        self.0
    }

    /// True when no blending happens.
    pub fn is_unguided(&self) -> bool {
        self.0 == 1.
    }

    pub fn combine(&self, cond: &Tensor, uncond: &Tensor) -> Tensor {
        if self.is_unguided() {
            return cond.shallow_clone();
        }
        uncond + (cond - uncond) * self.0
    }

    /// Runs the predictor once (scale 1) or twice, the second time with a
    /// zeroed conditioning, and blends the results.
    pub fn predict<P: NoisePredictor + ?Sized>(
        &self,
        predictor: &P,
        latents: &Tensor,
        timestep: usize,
        conditioning: Conditioning,
    ) -> Tensor {
        let cond = predictor.predict_noise(latents, timestep, conditioning);
        if self.is_unguided() {
            return cond;
        }
        let uncond = predictor.predict_noise(latents, timestep, Conditioning::zeros());
        self.combine(&cond, &uncond)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tch::{Device, Kind};

    struct Recorder {
        calls: Mutex<Vec<Conditioning>>,
    }

    impl NoisePredictor for Recorder {
        fn predict_noise(&self, latents: &Tensor, _: usize, conditioning: Conditioning) -> Tensor {
            self.calls.lock().unwrap().push(conditioning);
            latents.ones_like() * conditioning.valence
        }
    }

    fn inputs() -> (Tensor, Tensor) {
        let cond = Tensor::randn([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let uncond = Tensor::randn([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        (cond, uncond)
    }

    #[test]
    fn unit_scale_returns_conditioned() {
        let (cond, uncond) = inputs();
        let g = GuidanceScale::new(1.).unwrap();
        assert!(g.combine(&cond, &uncond).equal(&cond));
    }

    #[test]
    fn zero_scale_returns_unconditioned() {
        let (cond, uncond) = inputs();
        let g = GuidanceScale::new(0.).unwrap();
        assert!(g.combine(&cond, &uncond).equal(&uncond));
    }

    #[test]
    fn extrapolates_towards_condition() {
        let cond = Tensor::from_slice(&[2f32, 1.]);
        let uncond = Tensor::from_slice(&[1f32, 1.]);
        let g = GuidanceScale::new(5.).unwrap();
        assert!(g.combine(&cond, &uncond).equal(&Tensor::from_slice(&[6f32, 1.])));
    }

    #[test]
    fn invalid_scales() {
        assert!(GuidanceScale::new(-0.5).is_err());
        assert!(GuidanceScale::new(f64::NAN).is_err());
    }

    #[test]
    fn predictor_invocations() {
        let latents = Tensor::zeros([1, 3, 4, 4], (Kind::Float, Device::Cpu));
        let conditioning = Conditioning { valence: 0.5, arousal: 0.25 };

        let recorder = Recorder { calls: Mutex::new(vec![]) };
        let g = GuidanceScale::new(1.).unwrap();
        let noise = g.predict(&recorder, &latents, 3, conditioning);
        assert_eq!(*recorder.calls.lock().unwrap(), vec![conditioning]);
        assert_eq!(noise.double_value(&[0, 0, 0, 0]), 0.5);

        let recorder = Recorder { calls: Mutex::new(vec![]) };
        let g = GuidanceScale::new(3.).unwrap();
        let noise = g.predict(&recorder, &latents, 3, conditioning);
        assert_eq!(*recorder.calls.lock().unwrap(), vec![conditioning, Conditioning::zeros()]);
        assert_eq!(noise.double_value(&[0, 1, 2, 3]), 1.5);
    }
}
