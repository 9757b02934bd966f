use tch::{nn, nn::Module, Tensor};

/// Sinusoidal encoding of the diffusion timestep, `[sin | cos]` halves.
#[derive(Debug)]
pub struct SinusoidalPositionEmbeddings {
    dim: i64,
}

impl SinusoidalPositionEmbeddings {
    pub fn new(dim: i64) -> Self {
        Self { dim }
    }
}

impl Module for SinusoidalPositionEmbeddings {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let half_dim = self.dim / 2;
        let exponent = f64::ln(10000.) / (half_dim - 1) as f64;
        let emb = (Tensor::arange(half_dim, (xs.kind(), xs.device())) * -exponent).exp();
        // emb = time[:, None] * emb[None, :]
        let emb = xs.unsqueeze(-1) * emb.unsqueeze(0);
        Tensor::cat(&[emb.sin(), emb.cos()], -1)
    }
}

/// Two linear layers with a GELU in between, used for both the time and the
/// emotion embeddings. `first` and `second` are the parameter names of the
/// two layers.
#[derive(Debug)]
pub struct EmbeddingMlp {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
}

impl EmbeddingMlp {
    pub fn new(
        vs: nn::Path,
        (first, second): (usize, usize),
        in_dim: i64,
        hidden_dim: i64,
        out_dim: i64,
    ) -> Self {
        let linear_cfg = Default::default();
        let linear_1 = nn::linear(&vs / first, in_dim, hidden_dim, linear_cfg);
        let linear_2 = nn::linear(&vs / second, hidden_dim, out_dim, linear_cfg);
        Self { linear_1, linear_2 }
    }
}

impl Module for EmbeddingMlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.linear_1).gelu("none").apply(&self.linear_2)
    }
}
