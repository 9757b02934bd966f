// Small helpers shared by the schedulers and pipelines: noise sampling from a
// request-owned generator, artifact checks and image transport encoding.
use crate::{Error, Result};
use base64::{engine::general_purpose, Engine as _};
use rand::Rng;
use rand_distr::StandardNormal;
use std::io::Cursor;
use std::path::Path;
use tch::{Device, Kind, Tensor};

/// Samples a float tensor of standard-normal values with the given shape.
///
/// The values come from `rng` rather than from torch's global generator so
/// that each request controls its own randomness.
pub fn randn<R: Rng + ?Sized>(rng: &mut R, shape: &[i64], device: Device) -> Tensor {
    let numel: i64 = shape.iter().product();
    let values: Vec<f32> = (0..numel).map(|_| rng.sample(StandardNormal)).collect();
    Tensor::from_slice(&values).view(shape).to_device(device)
}

/// Same as [`randn`], matching the shape and device of `xs`.
pub fn randn_like<R: Rng + ?Sized>(rng: &mut R, xs: &Tensor) -> Tensor {
    randn(rng, &xs.size(), xs.device())
}

/// Fails with [`Error::MissingArtifact`] when `path` does not exist.
pub fn ensure_artifact<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        Ok(())
    } else {
        Err(Error::MissingArtifact { path: path.to_path_buf() })
    }
}

/// Encodes a `(3, height, width)` uint8 image as PNG bytes.
pub fn encode_png(image: &Tensor) -> Result<Vec<u8>> {
    let (channels, height, width) = image.size3()?;
    if channels != 3 || image.kind() != Kind::Uint8 {
        return Err(Error::InvalidConfiguration(format!(
            "expected a 3-channel uint8 image, got {channels} channels of {:?}",
            image.kind()
        )));
    }
    let pixels = Vec::<u8>::try_from(image.permute([1, 2, 0]).contiguous().flatten(0, -1))?;
    let buffer = image::RgbImage::from_raw(width as u32, height as u32, pixels).ok_or_else(|| {
        Error::InvalidConfiguration(format!("pixel buffer does not fit {width}x{height}"))
    })?;
    let mut bytes = Vec::new();
    buffer.write_to(&mut Cursor::new(&mut bytes), image::ImageOutputFormat::Png)?;
    Ok(bytes)
}

/// Encodes a `(3, height, width)` uint8 image as a `data:image/png;base64,`
/// URI, ready to be embedded in a JSON response.
pub fn png_data_uri(image: &Tensor) -> Result<String> {
    let bytes = encode_png(image)?;
    Ok(format!("data:image/png;base64,{}", general_purpose::STANDARD.encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn randn_is_seeded() {
        let xs1 = randn(&mut StdRng::seed_from_u64(42), &[1, 3, 4, 4], Device::Cpu);
        let xs2 = randn(&mut StdRng::seed_from_u64(42), &[1, 3, 4, 4], Device::Cpu);
        let xs3 = randn(&mut StdRng::seed_from_u64(43), &[1, 3, 4, 4], Device::Cpu);
        assert_eq!(xs1.size(), vec![1, 3, 4, 4]);
        assert_eq!(xs1.kind(), Kind::Float);
        assert!(xs1.equal(&xs2));
        assert!(!xs1.equal(&xs3));
    }

    #[test]
    fn missing_artifact() {
        let err = ensure_artifact("/definitely/not/here.safetensors").unwrap_err();
        assert!(matches!(err, Error::MissingArtifact { .. }));
        assert!(err.to_string().contains("here.safetensors"));
    }

    #[test]
    fn png_data_uri_prefix() {
        let image = Tensor::full([3, 8, 8], 128i64, (Kind::Uint8, Device::Cpu));
        let uri = png_data_uri(&image).unwrap();
        let payload = uri.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = general_purpose::STANDARD.decode(payload).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn png_rejects_float_images() {
        let image = Tensor::zeros([3, 8, 8], (Kind::Float, Device::Cpu));
        assert!(matches!(encode_png(&image), Err(Error::InvalidConfiguration(_))));
    }
}
