//! Run configuration for plug-and-play editing, read from a YAML document.
use anyhow::Context;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};

/// Local weight files for the pretrained components.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WeightsConfig {
    pub unet: PathBuf,
    pub vae: PathBuf,
    pub clip: PathBuf,
    pub vocab: PathBuf,
}

/// Blends the adapter towards a second adapter after loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterpolateConfig {
    pub weight_path: PathBuf,
    pub alpha: f64,
}

/// One style region: adapter weights, the mask where they apply and the style prompt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdapterConfig {
    pub weight_path: PathBuf,
    pub mask_path: PathBuf,
    pub prompt: String,
    /// Rank the adapter was trained with, 16 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpolate: Option<InterpolateConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PnpConfig {
    pub device: String,
    /// Model version tag, `1.5`, `2.0` or `2.1`. Validated when a run starts.
    #[serde(deserialize_with = "version_tag")]
    pub sd_version: String,
    pub prompt: String,
    pub negative_prompt: String,
    pub image_path: PathBuf,
    pub latents_path: PathBuf,
    pub output_path: PathBuf,
    pub guidance_scale: f64,
    pub n_timesteps: usize,
    /// Fraction of the timesteps receiving convolution feature injection.
    pub pnp_f_t: f64,
    /// Fraction of the timesteps receiving self-attention query/key injection.
    pub pnp_attn_t: f64,
    pub seed: i64,
    #[serde(default)]
    pub lora_configs: Vec<AdapterConfig>,
    pub weights: WeightsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sliced_attention_size: Option<i64>,
}

// YAML reads `sd_version: 2.1` as a number.
fn version_tag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Tag {
        Text(String),
        Number(f64),
    }
    Ok(match Tag::deserialize(deserializer)? {
        Tag::Text(s) => s,
        Tag::Number(v) => format!("{v:.1}"),
    })
}

impl PnpConfig {
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse config")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&yaml).with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Writes the effective configuration as `config.yaml` into the output directory,
    /// creating the directory when needed.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.output_path).with_context(|| {
            format!("failed to create output directory {}", self.output_path.display())
        })?;
        let path = self.output_path.join("config.yaml");
        std::fs::write(&path, serde_yaml::to_string(self)?)?;
        Ok(path)
    }

    /// Name of the generated image, `output-<prompt>.png` in the output directory.
    pub fn output_image_path(&self) -> PathBuf {
        self.output_path.join(format!("output-{}.png", self.prompt))
    }
}
