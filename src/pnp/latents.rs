//! Cached noisy latents of the source image, one file per scheduler timestep.
use crate::Error;
use std::path::{Path, PathBuf};
use tch::{Device, Tensor};

#[derive(Debug, Clone)]
pub struct SourceLatentStore {
    dir: PathBuf,
    device: Device,
}

impl SourceLatentStore {
    /// The latents of `image_path` live in `<latents_path>/<image file stem>/`.
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        latents_path: P,
        image_path: Q,
        device: Device,
    ) -> anyhow::Result<Self> {
        let image_path = image_path.as_ref();
        let stem = match image_path.file_stem() {
            Some(stem) => stem,
            None => anyhow::bail!("cannot derive an image name from {}", image_path.display()),
        };
        Ok(Self { dir: latents_path.as_ref().join(stem), device })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, timestep: usize) -> PathBuf {
        self.dir.join(format!("noisy_latents_{timestep}.pt"))
    }

    /// Loads the latent cached for exactly `timestep`, with a leading batch dimension.
    pub fn load(&self, timestep: usize) -> anyhow::Result<Tensor> {
        let path = self.path_for(timestep);
        if !path.is_file() {
            return Err(Error::MissingSourceLatent { timestep, path }.into());
        }
        let latent = Tensor::load(&path)?.to(self.device);
        let latent = if latent.dim() == 3 { latent.unsqueeze(0) } else { latent };
        log::debug!("loaded source latent {:?} for timestep {timestep}", latent.size());
        Ok(latent)
    }
}
