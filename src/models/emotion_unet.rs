//! Emotion-conditioned UNet
//!
//! A convolutional UNet predicting the noise of a 3-channel image from the
//! current timestep and a (valence, arousal) pair. The time embedding is
//! added to every block, the emotion embedding modulates the features
//! through a scale and shift.
use super::attention::{SelfAttention, SelfAttentionConfig};
use super::embeddings::{EmbeddingMlp, SinusoidalPositionEmbeddings};
use super::{Conditioning, NoisePredictor};
use crate::utils::ensure_artifact;
use crate::{Error, Result};
use once_cell::sync::OnceCell;
use std::path::{Path, PathBuf};
use tch::{nn, Device, Kind, Tensor};

#[derive(Debug, Clone)]
pub struct EmotionUNetConfig {
    pub in_channels: i64,
    pub out_channels: i64,
    pub time_dim: i64,
    pub emotion_dim: i64,
    /// Output channels of the encoder blocks, from the highest resolution.
    pub block_channels: Vec<i64>,
    pub norm_num_groups: i64,
    pub attention_heads: i64,
    /// Encoder level followed by self-attention. The decoder level one above
    /// it gets self-attention too.
    pub attention_level: usize,
    /// Strength of the emotion scale and shift applied inside each block.
    pub film_strength: f64,
}

impl Default for EmotionUNetConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            time_dim: 256,
            emotion_dim: 2,
            block_channels: vec![64, 128, 256, 512, 1024],
            norm_num_groups: 8,
            attention_heads: 8,
            attention_level: 2,
            film_strength: 0.3,
        }
    }
}

#[derive(Debug)]
struct ConvBlock {
    convs: [nn::Conv2D; 4],
    norms: [nn::GroupNorm; 4],
    residual_proj: Option<nn::Conv2D>,
    time_emb: nn::Linear,
    va_scale: nn::Linear,
    va_shift: nn::Linear,
    film_strength: f64,
}

impl ConvBlock {
    fn new(vs: nn::Path, in_channels: i64, out_channels: i64, config: &EmotionUNetConfig) -> Self {
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let group_cfg = nn::GroupNormConfig { eps: 1e-5, affine: true, ..Default::default() };
        let conv = |i: usize, c_in| {
            nn::conv2d(&vs / format!("conv{i}"), c_in, out_channels, 3, conv_cfg)
        };
        let groups = config.norm_num_groups;
        let norm = |i: usize| {
            nn::group_norm(&vs / format!("norm{i}"), groups, out_channels, group_cfg)
        };
        let convs = [
            conv(1, in_channels),
            conv(2, out_channels),
            conv(3, out_channels),
            conv(4, out_channels),
        ];
        let norms = [norm(1), norm(2), norm(3), norm(4)];
        let residual_proj = if in_channels != out_channels {
            let vs = &vs / "residual_proj";
            Some(nn::conv2d(vs, in_channels, out_channels, 1, Default::default()))
        } else {
            None
        };
        let linear = |name: &str| {
            nn::linear(&vs / name, config.time_dim, out_channels, Default::default())
        };
        Self {
            convs,
            norms,
            residual_proj,
            time_emb: linear("time_emb"),
            va_scale: linear("va_scale"),
            va_shift: linear("va_shift"),
            film_strength: config.film_strength,
        }
    }

    fn forward(&self, xs: &Tensor, temb: &Tensor, eemb: &Tensor) -> Tensor {
        let residual = match &self.residual_proj {
            Some(residual_proj) => xs.apply(residual_proj),
            None => xs.shallow_clone(),
        };
        let ys = xs.apply(&self.convs[0]).apply(&self.norms[0]).silu();
        let ys = ys + temb.apply(&self.time_emb).unsqueeze(-1).unsqueeze(-1);
        let ys = (ys.apply(&self.convs[1]).apply(&self.norms[1]) + residual).silu();

        let residual = ys.shallow_clone();
        let ys = ys.apply(&self.convs[2]).apply(&self.norms[2]);
        let scale = eemb.apply(&self.va_scale).unsqueeze(-1).unsqueeze(-1);
        let shift = eemb.apply(&self.va_shift).unsqueeze(-1).unsqueeze(-1);
        let ys = ys * (scale * self.film_strength + 1.) + shift * self.film_strength;
        let ys = ys.silu().apply(&self.convs[3]).apply(&self.norms[3]);
        (ys + residual).silu()
    }
}

#[derive(Debug)]
pub struct EmotionConditionedUNet {
    time_proj: SinusoidalPositionEmbeddings,
    time_mlp: EmbeddingMlp,
    emotion_embed: EmbeddingMlp,
    encoders: Vec<ConvBlock>,
    encoder_attention: SelfAttention,
    bottleneck: ConvBlock,
    decoders: Vec<ConvBlock>,
    decoder_attention: SelfAttention,
    conv_out: nn::Conv2D,
    config: EmotionUNetConfig,
}

impl EmotionConditionedUNet {
    pub fn new(vs: nn::Path, config: EmotionUNetConfig) -> Self {
        let n_blocks = config.block_channels.len();
        assert!(config.attention_level + 1 < n_blocks, "attention level out of range");
        let channels = &config.block_channels;
        let time_proj = SinusoidalPositionEmbeddings::new(config.time_dim);
        let time_mlp = EmbeddingMlp::new(
            &vs / "time_mlp",
            (1, 3),
            config.time_dim,
            config.time_dim * 4,
            config.time_dim,
        );
        let emotion_embed = EmbeddingMlp::new(
            &vs / "emotion_embed",
            (0, 2),
            config.emotion_dim,
            config.time_dim,
            config.time_dim,
        );

        let encoders = (0..n_blocks)
            .map(|i| {
                let in_channels = if i > 0 { channels[i - 1] } else { config.in_channels };
                ConvBlock::new(&vs / format!("enc{}", i + 1), in_channels, channels[i], &config)
            })
            .collect();
        let bottleneck_channels = channels[n_blocks - 1];
        let bottleneck =
            ConvBlock::new(&vs / "bottleneck", bottleneck_channels, bottleneck_channels, &config);
        // Decoders are stored from the lowest resolution up.
        let decoders = (0..n_blocks)
            .rev()
            .map(|i| {
                let prev_channels =
                    if i == n_blocks - 1 { bottleneck_channels } else { channels[i] };
                let out_channels = if i > 0 { channels[i - 1] } else { channels[0] };
                ConvBlock::new(
                    &vs / format!("dec{}", i + 1),
                    prev_channels + channels[i],
                    out_channels,
                    &config,
                )
            })
            .collect();

        let attn_cfg = SelfAttentionConfig {
            num_heads: config.attention_heads,
            num_groups: config.norm_num_groups,
            ..Default::default()
        };
        let level = config.attention_level;
        let encoder_attention =
            SelfAttention::new(&vs / format!("attn{}", level + 1), channels[level], attn_cfg);
        let decoder_attention =
            SelfAttention::new(&vs / format!("attn{}", level + 2), channels[level], attn_cfg);
        let conv_out =
            nn::conv2d(&vs / "final", channels[0], config.out_channels, 1, Default::default());
        Self {
            time_proj,
            time_mlp,
            emotion_embed,
            encoders,
            encoder_attention,
            bottleneck,
            decoders,
            decoder_attention,
            conv_out,
            config,
        }
    }

    pub fn forward(&self, xs: &Tensor, timestep: f64, valence: f64, arousal: f64) -> Tensor {
        let (bsize, _channels, _height, _width) = xs.size4().unwrap();
        let device = xs.device();
        let level = self.config.attention_level;
        // 1. time and emotion embeddings
        let temb = (Tensor::ones([bsize], (Kind::Float, device)) * timestep)
            .apply(&self.time_proj)
            .apply(&self.time_mlp);
        let emotion = Tensor::from_slice(&[valence as f32, arousal as f32])
            .to_device(device)
            .view((1, 2))
            .repeat([bsize, 1]);
        let eemb = emotion.apply(&self.emotion_embed);
        // 2. down
        let mut skips = Vec::with_capacity(self.encoders.len());
        let mut ys = xs.shallow_clone();
        for (i, encoder) in self.encoders.iter().enumerate() {
            if i > 0 {
                ys = max_pool(&ys);
            }
            ys = encoder.forward(&ys, &temb, &eemb);
            if i == level {
                ys = ys.apply(&self.encoder_attention);
            }
            skips.push(ys.shallow_clone());
        }
        // 3. bottleneck
        let mut ys = self.bottleneck.forward(&max_pool(&ys), &temb, &eemb);
        // 4. up
        for (decoder, i) in self.decoders.iter().zip((0..self.encoders.len()).rev()) {
            let ys_up = upsample(&ys);
            let ys_cat = Tensor::cat(&[ys_up, skips[i].shallow_clone()], 1);
            ys = decoder.forward(&ys_cat, &temb, &eemb);
            if i == level + 1 {
                ys = ys.apply(&self.decoder_attention);
            }
        }
        // 5. post-process
        ys.apply(&self.conv_out)
    }
}

fn max_pool(xs: &Tensor) -> Tensor {
    xs.max_pool2d([2, 2], [2, 2], [0, 0], [1, 1], false)
}

fn upsample(xs: &Tensor) -> Tensor {
    let (_bsize, _channels, h, w) = xs.size4().unwrap();
    xs.upsample_bilinear2d([2 * h, 2 * w], false, Some(2.), Some(2.))
}

impl NoisePredictor for EmotionConditionedUNet {
    fn predict_noise(
        &self,
        latents: &Tensor,
        timestep: usize,
        conditioning: Conditioning,
    ) -> Tensor {
        self.forward(latents, timestep as f64, conditioning.valence, conditioning.arousal)
    }

    /// Every encoder level but the first halves the resolution, as does the
    /// bottleneck, and each decoder level doubles it back: the spatial sizes
    /// must be divisible by `2^block_channels.len()`.
    fn check_latents_shape(&self, shape: &[i64]) -> Result<()> {
        let factor = 1i64 << self.config.block_channels.len();
        let (channels, height, width) = match shape {
            [_, channels, height, width] => (*channels, *height, *width),
            _ => {
                return Err(Error::InvalidConfiguration(format!(
                    "unexpected latents shape {shape:?}"
                )))
            }
        };
        if channels != self.config.in_channels {
            return Err(Error::InvalidConfiguration(format!(
                "the unet expects {} input channels, got {channels}",
                self.config.in_channels
            )));
        }
        if height <= 0 || width <= 0 || height % factor != 0 || width % factor != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "image size {height}x{width} is not a positive multiple of {factor}"
            )));
        }
        Ok(())
    }
}

/// Builds the UNet and loads its weights from `weights`.
pub fn build_unet<P: AsRef<Path>>(
    weights: P,
    config: EmotionUNetConfig,
    device: Device,
) -> Result<EmotionConditionedUNet> {
    ensure_artifact(&weights)?;
    let mut vs = nn::VarStore::new(device);
    let unet = EmotionConditionedUNet::new(vs.root(), config);
    vs.load(weights)?;
    Ok(unet)
}

/// A UNet whose weights are only loaded on first use, then shared read-only.
#[derive(Debug)]
pub struct LazyUNet {
    weights: PathBuf,
    config: EmotionUNetConfig,
    device: Device,
    unet: OnceCell<EmotionConditionedUNet>,
}

impl LazyUNet {
    pub fn new<P: Into<PathBuf>>(weights: P, config: EmotionUNetConfig, device: Device) -> Self {
        Self { weights: weights.into(), config, device, unet: OnceCell::new() }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn get(&self) -> Result<&EmotionConditionedUNet> {
        self.unet.get_or_try_init(|| {
            let weights = self.weights.display();
            tracing::info!(%weights, device = ?self.device, "loading unet");
            build_unet(&self.weights, self.config.clone(), self.device)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> EmotionUNetConfig {
        EmotionUNetConfig {
            time_dim: 16,
            block_channels: vec![8, 16, 16, 32, 32],
            ..Default::default()
        }
    }

    #[test]
    fn output_matches_input_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = EmotionConditionedUNet::new(vs.root(), small_config());
        let xs = Tensor::randn([1, 3, 32, 32], (Kind::Float, Device::Cpu));
        let conditioning = Conditioning { valence: 0.5, arousal: 0.2 };
        let ys = tch::no_grad(|| unet.predict_noise(&xs, 7, conditioning));
        assert_eq!(ys.size(), vec![1, 3, 32, 32]);
    }

    #[test]
    fn parameter_names() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _unet = EmotionConditionedUNet::new(vs.root(), small_config());
        let names: Vec<String> = vs.variables().into_keys().collect();
        for name in [
            "time_mlp.1.weight",
            "emotion_embed.2.bias",
            "enc1.residual_proj.weight",
            "enc3.va_shift.weight",
            "attn3.qkv.weight",
            "attn4.norm.weight",
            "bottleneck.conv4.bias",
            "dec5.norm1.weight",
            "dec1.time_emb.weight",
            "final.weight",
        ] {
            assert!(names.iter().any(|n| n == name), "missing {name}");
        }
        // Blocks keeping their channel count have no residual projection.
        assert!(!names.iter().any(|n| n.starts_with("bottleneck.residual_proj")));
    }

    #[test]
    fn latents_shape_checks() {
        let vs = nn::VarStore::new(Device::Cpu);
        let unet = EmotionConditionedUNet::new(vs.root(), small_config());
        assert!(unet.check_latents_shape(&[1, 3, 32, 64]).is_ok());
        for shape in [[1i64, 3, 100, 128], [1, 3, 128, 100], [1, 4, 128, 128], [1, 3, 0, 32]] {
            assert!(
                matches!(unet.check_latents_shape(&shape), Err(Error::InvalidConfiguration(_))),
                "{shape:?}"
            );
        }
    }

    #[test]
    fn weights_are_loaded_once() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("unet.ot");
        let vs = nn::VarStore::new(Device::Cpu);
        let _unet = EmotionConditionedUNet::new(vs.root(), small_config());
        vs.save(&weights).unwrap();

        let lazy = LazyUNet::new(&weights, small_config(), Device::Cpu);
        let first = lazy.get().unwrap();
        // Later calls never touch the file again.
        std::fs::remove_file(&weights).unwrap();
        let second = lazy.get().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn missing_weights() {
        let lazy = LazyUNet::new("/no/such/unet.safetensors", small_config(), Device::Cpu);
        assert!(matches!(lazy.get(), Err(Error::MissingArtifact { .. })));
    }
}
