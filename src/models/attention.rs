//! Multi-head self-attention over the spatial positions of a feature map.
use tch::{nn, nn::Module, Kind, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct SelfAttentionConfig {
    pub num_heads: i64,
    pub num_groups: i64,
    pub eps: f64,
}

impl Default for SelfAttentionConfig {
    fn default() -> Self {
        Self { num_heads: 8, num_groups: 8, eps: 1e-5 }
    }
}

#[derive(Debug)]
pub struct SelfAttention {
    norm: nn::GroupNorm,
    qkv: nn::Conv2D,
    proj: nn::Conv2D,
    channels: i64,
    num_heads: i64,
}

impl SelfAttention {
    pub fn new(vs: nn::Path, channels: i64, config: SelfAttentionConfig) -> Self {
        assert_eq!(channels % config.num_heads, 0, "channels must be divisible by num_heads");
        let group_cfg = nn::GroupNormConfig { eps: config.eps, affine: true, ..Default::default() };
        let norm = nn::group_norm(&vs / "norm", config.num_groups, channels, group_cfg);
        let qkv = nn::conv2d(&vs / "qkv", channels, channels * 3, 1, Default::default());
        let proj = nn::conv2d(&vs / "proj", channels, channels, 1, Default::default());
        Self { norm, qkv, proj, channels, num_heads: config.num_heads }
    }
}

impl Module for SelfAttention {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let (batch, channels, height, width) = xs.size4().unwrap();
        let head_dim = self.channels / self.num_heads;
        // (3, batch, heads, positions, head_dim)
        let qkv = xs
            .apply(&self.norm)
            .apply(&self.qkv)
            .reshape([batch, 3, self.num_heads, head_dim, height * width])
            .permute([1, 0, 2, 4, 3]);
        let (query, key, value) = (qkv.get(0), qkv.get(1), qkv.get(2));

        let scale = (head_dim as f64).powf(-0.5);
        let attention_scores = query.matmul(&key.transpose(-2, -1)) * scale;
        let attention_probs = attention_scores.softmax(-1, Kind::Float);
        let ys = attention_probs
            .matmul(&value)
            .permute([0, 1, 3, 2])
            .reshape([batch, channels, height, width])
            .apply(&self.proj);
        ys + xs
    }
}
