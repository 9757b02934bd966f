// Renders an image from a (valence, arousal) pair with the emotion-conditioned
// diffusion model.
//
// The weights of the UNet have to be converted to a format that tch can load,
// keeping the original parameter names, e.g. from python:
//
//   import torch
//   from safetensors.torch import save_file
//   save_file(torch.load("diffusion.pth", map_location="cpu"), "data/unet.safetensors")
//
// Then run with:
//
//   cargo run --release --features clap --example music-to-image -- \
//       --valence 6.5 --arousal 3 --seed 42
use clap::Parser;
use music_diffusion::pipelines::music_to_image::{MusicToImageConfig, MusicToImagePipeline};
use music_diffusion::pipelines::GenerationControl;
use tch::Device;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Valence of the music, between 0 and 9.
    #[arg(long, default_value_t = 4.5)]
    valence: f64,

    /// Arousal of the music, between 0 and 9.
    #[arg(long, default_value_t = 4.5)]
    arousal: f64,

    /// When set, use the CPU even if some CUDA devices are available.
    #[arg(long)]
    cpu: bool,

    /// The UNet weight file, in .ot or .safetensors format.
    #[arg(long, value_name = "FILE", default_value = "data/unet.safetensors")]
    unet_weights: String,

    /// The number of steps to run the diffusion for.
    #[arg(long, default_value_t = 1000)]
    n_steps: usize,

    /// Classifier-free guidance scale, 1 disables guidance.
    #[arg(long, default_value_t = 5.0)]
    guidance_scale: f64,

    /// The random seed to be used for the generation.
    #[arg(long)]
    seed: Option<u64>,

    /// The name of the final image to generate.
    #[arg(long, value_name = "FILE", default_value = "music_to_image.png")]
    final_image: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();
    tch::maybe_init_cuda();
    tracing::info!(cuda = tch::Cuda::is_available(), cudnn = tch::Cuda::cudnn_is_available());
    let device = if args.cpu { Device::Cpu } else { Device::cuda_if_available() };

    let config = MusicToImageConfig {
        guidance_scale: args.guidance_scale,
        n_steps: args.n_steps,
        seed: args.seed,
        ..Default::default()
    };
    let pipeline = MusicToImagePipeline::new(args.unet_weights, Default::default(), config, device);
    let image = pipeline.generate_image(args.valence, args.arousal, &GenerationControl::new())?;
    tch::vision::image::save(&image, &args.final_image)?;
    tracing::info!(final_image = %args.final_image, "image saved");
    Ok(())
}
