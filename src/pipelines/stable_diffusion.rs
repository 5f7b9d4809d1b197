//! Model configurations and builders for the supported Stable Diffusion versions.
use crate::models::lora::{LoraConfig, LoraPath};
use crate::models::unet_2d::{self, UNet2DConditionModel};
use crate::utils::require_file;
use crate::Error;
use diffusers::models::vae;
use diffusers::schedulers::{ddim, PredictionType};
use diffusers::transformers::clip;
use std::path::Path;
use tch::{nn, Device, Tensor};

/// The latent scaling factor of the Stable Diffusion autoencoders.
pub const VAE_SCALE: f64 = 0.18215;

/// Maps latents back to images with values in `[0, 1]`.
pub fn decode_latents(vae: &vae::AutoEncoderKL, latents: &Tensor) -> Tensor {
    let images = vae.decode(&(latents / VAE_SCALE));
    (images / 2 + 0.5).clamp(0., 1.)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersion {
    V1_5,
    V2_0,
    V2_1,
}

impl std::str::FromStr for ModelVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1.5" => Ok(Self::V1_5),
            "2.0" => Ok(Self::V2_0),
            "2.1" => Ok(Self::V2_1),
            other => Err(Error::UnsupportedModelVersion(other.to_string())),
        }
    }
}

impl std::fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::V1_5 => "1.5",
            Self::V2_0 => "2.0",
            Self::V2_1 => "2.1",
        };
        write!(f, "{s}")
    }
}

/// A UNet together with the variable stores backing it.
#[derive(Debug)]
pub struct UNetStore {
    pub vs: nn::VarStore,
    /// The adapter variables, present when the UNet was built with adapters.
    pub lora_vs: Option<nn::VarStore>,
    pub unet: UNet2DConditionModel,
}

#[derive(Debug, Clone)]
pub struct StableDiffusionConfig {
    pub version: ModelVersion,
    pub width: i64,
    pub height: i64,
    pub clip: clip::Config,
    pub autoencoder: vae::AutoEncoderKLConfig,
    pub unet: unet_2d::UNet2DConditionModelConfig,
    pub scheduler: ddim::DDIMSchedulerConfig,
}

impl StableDiffusionConfig {
    pub fn for_version(version: ModelVersion, sliced_attention_size: Option<i64>) -> Self {
        match version {
            ModelVersion::V1_5 => Self::v1_5(sliced_attention_size),
            ModelVersion::V2_0 | ModelVersion::V2_1 => Self::v2_base(version, sliced_attention_size),
        }
    }

    fn autoencoder() -> vae::AutoEncoderKLConfig {
        // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/vae/config.json
        vae::AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
        }
    }

    fn v1_5(sliced_attention_size: Option<i64>) -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| unet_2d::BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        // https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/unet/config.json
        let unet = unet_2d::UNet2DConditionModelConfig {
            blocks: vec![bc(320, true, 8), bc(640, true, 8), bc(1280, true, 8), bc(1280, false, 8)],
            cross_attention_dim: 768,
            sliced_attention_size,
            use_linear_projection: false,
            ..Default::default()
        };
        Self {
            version: ModelVersion::V1_5,
            width: 512,
            height: 512,
            clip: clip::Config::v1_5(),
            autoencoder: Self::autoencoder(),
            scheduler: Default::default(),
            unet,
        }
    }

    // The 512x512 "base" checkpoints of 2.0 and 2.1 share their architecture and are
    // trained with epsilon prediction.
    fn v2_base(version: ModelVersion, sliced_attention_size: Option<i64>) -> Self {
        let bc = |out_channels, use_cross_attn, attention_head_dim| unet_2d::BlockConfig {
            out_channels,
            use_cross_attn,
            attention_head_dim,
        };
        // https://huggingface.co/stabilityai/stable-diffusion-2-1-base/blob/main/unet/config.json
        let unet = unet_2d::UNet2DConditionModelConfig {
            blocks: vec![
                bc(320, true, 5),
                bc(640, true, 10),
                bc(1280, true, 20),
                bc(1280, false, 20),
            ],
            cross_attention_dim: 1024,
            sliced_attention_size,
            use_linear_projection: true,
            ..Default::default()
        };
        Self {
            version,
            width: 512,
            height: 512,
            clip: clip::Config::v2_1(),
            autoencoder: Self::autoencoder(),
            scheduler: Default::default(),
            unet,
        }
    }

    pub fn latent_size(&self) -> (i64, i64) {
        (self.height / 8, self.width / 8)
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.scheduler.prediction_type
    }

    fn new_unet(&self, device: Device, lora: Option<(&nn::VarStore, LoraConfig)>) -> (nn::VarStore, UNet2DConditionModel) {
        let vs = nn::VarStore::new(device);
        let lora = match lora {
            Some((lora_vs, config)) => LoraPath::new(lora_vs.root(), config),
            None => LoraPath::none(),
        };
        let unet = UNet2DConditionModel::new(vs.root(), lora, 4, 4, self.unet.clone());
        (vs, unet)
    }

    pub fn build_unet<P: AsRef<Path>>(&self, unet_weights: P, device: Device) -> anyhow::Result<UNetStore> {
        let unet_weights = require_file("unet weights", unet_weights)?;
        let (mut vs, unet) = self.new_unet(device, None);
        vs.load(&unet_weights)?;
        Ok(UNetStore { vs, lora_vs: None, unet })
    }

    /// Loads the base weights from `unet_weights` and freezes them, then attaches freshly
    /// initialized adapters. Only the adapters in the returned `lora_vs` are trainable.
    pub fn build_trainable_unet<P: AsRef<Path>>(
        &self,
        unet_weights: P,
        device: Device,
        lora_config: LoraConfig,
    ) -> anyhow::Result<UNetStore> {
        let unet_weights = require_file("unet weights", unet_weights)?;
        let lora_vs = nn::VarStore::new(device);
        let (mut vs, unet) = self.new_unet(device, Some((&lora_vs, lora_config)));
        vs.load(&unet_weights)?;
        vs.freeze();
        Ok(UNetStore { vs, lora_vs: Some(lora_vs), unet })
    }

    /// Deep-copies the base UNet weights into a new network and loads adapter weights on
    /// top of them. The copy shares no storage with `base`.
    pub fn build_adapter_unet<P: AsRef<Path>>(
        &self,
        base: &nn::VarStore,
        lora_weights: P,
        lora_config: LoraConfig,
    ) -> anyhow::Result<UNetStore> {
        let lora_weights = require_file("adapter weights", lora_weights)?;
        let device = base.device();
        let mut lora_vs = nn::VarStore::new(device);
        let (mut vs, unet) = self.new_unet(device, Some((&lora_vs, lora_config)));
        vs.copy(base)?;
        lora_vs.load(&lora_weights)?;
        Ok(UNetStore { vs, lora_vs: Some(lora_vs), unet })
    }

    pub fn build_vae<P: AsRef<Path>>(&self, vae_weights: P, device: Device) -> anyhow::Result<vae::AutoEncoderKL> {
        let vae_weights = require_file("vae weights", vae_weights)?;
        let mut vs_ae = nn::VarStore::new(device);
        let autoencoder = vae::AutoEncoderKL::new(vs_ae.root(), 3, 3, self.autoencoder.clone());
        vs_ae.load(&vae_weights)?;
        Ok(autoencoder)
    }

    pub fn build_clip_transformer<P: AsRef<Path>>(
        &self,
        clip_weights: P,
        device: Device,
    ) -> anyhow::Result<clip::ClipTextTransformer> {
        let clip_weights = require_file("clip weights", clip_weights)?;
        let mut vs = nn::VarStore::new(device);
        let text_model = clip::ClipTextTransformer::new(vs.root(), &self.clip);
        vs.load(&clip_weights)?;
        Ok(text_model)
    }

    pub fn build_tokenizer<P: AsRef<Path>>(&self, vocab_file: P) -> anyhow::Result<clip::Tokenizer> {
        let vocab_file = require_file("vocabulary", vocab_file)?;
        clip::Tokenizer::create(vocab_file, &self.clip)
    }

    /// The DDIM sampler with `n_steps` inference steps. Each step has to skip at least one
    /// training timestep, so `n_steps` is bounded by the training schedule length.
    pub fn build_scheduler(&self, n_steps: usize) -> anyhow::Result<ddim::DDIMScheduler> {
        let train_timesteps = self.scheduler.train_timesteps;
        if n_steps == 0 || n_steps > train_timesteps {
            return Err(Error::InvalidTimestepCount { n_timesteps: n_steps, train_timesteps }.into());
        }
        Ok(ddim::DDIMScheduler::new(n_steps, self.scheduler))
    }
}
