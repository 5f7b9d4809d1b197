use crate::Error;
use std::path::{Path, PathBuf};
use tch::Device;

/// Fails with [`Error::MissingArtifact`] when a required input file is absent.
pub fn require_file<P: AsRef<Path>>(kind: &'static str, path: P) -> anyhow::Result<PathBuf> {
    let path = path.as_ref();
    if path.is_file() {
        Ok(path.to_path_buf())
    } else {
        Err(Error::MissingArtifact { kind, path: path.to_path_buf() }.into())
    }
}

/// Parses the device selector used in configuration files and on the command line.
pub fn parse_device(name: &str) -> anyhow::Result<Device> {
    let device = match name.trim().to_lowercase().as_str() {
        "cpu" => Device::Cpu,
        "cuda" => {
            tch::maybe_init_cuda();
            Device::Cuda(0)
        }
        "mps" => Device::Mps,
        other => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(index)) => {
                tch::maybe_init_cuda();
                Device::Cuda(index)
            }
            _ => return Err(Error::UnknownDevice(name.to_string()).into()),
        },
    };
    Ok(device)
}

/// Half precision autocast is only used where the device supports it. MPS and CPU
/// always run in full precision.
pub fn supports_autocast(device: Device) -> bool {
    matches!(device, Device::Cuda(_))
}

/// Runs `f`, under autocast when the device supports mixed precision.
pub fn with_precision<T, F>(device: Device, f: F) -> T
where
    F: FnOnce() -> T,
{
    if supports_autocast(device) {
        tch::autocast(true, f)
    } else {
        f()
    }
}

/// Loads an image file as a float tensor of shape `(1, 3, height, width)` with values in
/// `[0, 1]`, resized to the requested resolution.
pub fn load_image<P: AsRef<Path>>(path: P, width: i64, height: i64) -> anyhow::Result<tch::Tensor> {
    let path = require_file("image", path)?;
    let image = tch::vision::image::load(&path)?;
    let image = tch::vision::image::resize(&image, width, height)?;
    Ok((image.to_kind(tch::Kind::Float) / 255.).unsqueeze(0))
}

/// Loads an image like [`load_image`] but keeps its aspect ratio: the shorter side is
/// scaled to `shorter_side` and both sides are then rounded down to a multiple of
/// `multiple_of`.
pub fn load_image_shorter_side<P: AsRef<Path>>(
    path: P,
    shorter_side: i64,
    multiple_of: i64,
) -> anyhow::Result<tch::Tensor> {
    let path = require_file("image", path)?;
    let image = tch::vision::image::load(&path)?;
    let (_, height, width) = image.size3()?;
    let scale = shorter_side as f64 / height.min(width) as f64;
    let round = |side: i64| (((side as f64 * scale).round() as i64) / multiple_of * multiple_of).max(multiple_of);
    let image = tch::vision::image::resize(&image, round(width), round(height))?;
    Ok((image.to_kind(tch::Kind::Float) / 255.).unsqueeze(0))
}

/// Saves a `(1, 3, height, width)` or `(3, height, width)` tensor with values in `[0, 1]`.
pub fn save_image<P: AsRef<Path>>(image: &tch::Tensor, path: P) -> anyhow::Result<()> {
    let image = if image.dim() == 4 { image.squeeze_dim(0) } else { image.shallow_clone() };
    let image = (image.clamp(0., 1.) * 255.).to_device(Device::Cpu).to_kind(tch::Kind::Uint8);
    tch::vision::image::save(&image, path.as_ref())?;
    Ok(())
}

pub fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

pub(crate) fn progress_bar(len: u64, message: &'static str) -> indicatif::ProgressBar {
    let pb = indicatif::ProgressBar::new(len);
    if let Ok(style) = indicatif::ProgressStyle::default_bar()
        .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {pos}/{len} ({elapsed})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }
    pb.set_message(message);
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_selectors() {
        assert_eq!(parse_device("cpu").unwrap(), Device::Cpu);
        assert_eq!(parse_device("MPS").unwrap(), Device::Mps);
        let err = parse_device("tpu").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnknownDevice(_))));
        let err = parse_device("cuda:x").unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnknownDevice(_))));
    }

    #[test]
    fn only_cuda_autocasts() {
        assert!(!supports_autocast(Device::Cpu));
        assert!(!supports_autocast(Device::Mps));
        assert!(supports_autocast(Device::Cuda(0)));
    }

    #[test]
    fn shorter_side_resize_keeps_the_aspect_ratio() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        image::RgbImage::from_pixel(100, 50, image::Rgb([255, 0, 0])).save(&path).unwrap();
        let image = load_image_shorter_side(&path, 16, 8).unwrap();
        assert_eq!(image.size(), [1, 3, 16, 32]);
        let image = load_image_shorter_side(&path, 20, 8).unwrap();
        assert_eq!(image.size(), [1, 3, 16, 40]);
        assert!((image.max().double_value(&[]) - 1.).abs() < 1e-6);
    }

    #[test]
    fn missing_file_is_an_artifact_error() {
        let err = require_file("mask", "/nonexistent/mask.png").unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::MissingArtifact { kind, .. }) => assert_eq!(*kind, "mask"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
