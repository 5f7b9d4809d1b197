//! The editing workflow, from a configuration file to the generated image.
use crate::config::{AdapterConfig, PnpConfig};
use crate::models::lora::{self, LoraConfig};
use crate::pipelines::stable_diffusion::{decode_latents, ModelVersion, StableDiffusionConfig};
use crate::pnp::adapters::{load_mask, StyleAdapter};
use crate::pnp::embeddings::TextEmbedder;
use crate::pnp::injection::injection_steps;
use crate::pnp::latents::SourceLatentStore;
use crate::pnp::sampler::PlugAndPlay;
use crate::utils::{parse_device, save_image, with_precision};
use log::info;
use std::path::PathBuf;
use tch::{nn, Device};

fn load_adapter(
    sd_config: &StableDiffusionConfig,
    base: &nn::VarStore,
    config: &AdapterConfig,
    embedder: &TextEmbedder,
    negative_prompt: &str,
    device: Device,
) -> anyhow::Result<StyleAdapter> {
    let lora_config = LoraConfig { rank: config.rank.unwrap_or(LoraConfig::default().rank), ..Default::default() };
    let store = sd_config.build_adapter_unet(base, &config.weight_path, lora_config)?;
    if let (Some(interpolate), Some(lora_vs)) = (&config.interpolate, &store.lora_vs) {
        let other = lora::read_weights(&interpolate.weight_path)?;
        lora::interpolate(lora_vs, &other, interpolate.alpha)?;
        info!(
            "blended {} towards {} with alpha {}",
            config.weight_path.display(),
            interpolate.weight_path.display(),
            interpolate.alpha
        );
    }
    let (height, width) = sd_config.latent_size();
    let mask = load_mask(&config.mask_path, height, width, device)?;
    let text_embeddings = embedder.embedding_pair(&config.prompt, negative_prompt)?;
    Ok(StyleAdapter::new(store.unet, mask, text_embeddings))
}

/// Runs a full edit and returns the path of the generated image.
pub fn run(config: &PnpConfig) -> anyhow::Result<PathBuf> {
    // Rejected before anything is read from disk.
    let version: ModelVersion = config.sd_version.parse()?;
    let device = parse_device(&config.device)?;
    let sd_config = StableDiffusionConfig::for_version(version, config.sliced_attention_size);
    let scheduler = sd_config.build_scheduler(config.n_timesteps)?;
    let config_path = config.save()?;
    info!("saved run configuration to {}", config_path.display());
    tch::manual_seed(config.seed);

    info!("loading Stable Diffusion {version} on {device:?}");
    let tokenizer = sd_config.build_tokenizer(&config.weights.vocab)?;
    let text_model = sd_config.build_clip_transformer(&config.weights.clip, device)?;
    let embedder = TextEmbedder::new(tokenizer, text_model, device);
    let text_embeddings = embedder.embedding_pair(&config.prompt, &config.negative_prompt)?;
    let guidance_embedding = embedder.guidance_embedding()?;

    let vae = sd_config.build_vae(&config.weights.vae, device)?;
    let base = sd_config.build_unet(&config.weights.unet, device)?;
    let source_latents = SourceLatentStore::new(&config.latents_path, &config.image_path, device)?;

    let mut adapters = Vec::with_capacity(config.lora_configs.len());
    for adapter_config in config.lora_configs.iter() {
        info!("loading style adapter {}", adapter_config.weight_path.display());
        adapters.push(load_adapter(
            &sd_config,
            &base.vs,
            adapter_config,
            &embedder,
            &config.negative_prompt,
            device,
        )?);
    }

    let mut pnp = PlugAndPlay::new(
        base.unet,
        scheduler,
        source_latents,
        text_embeddings,
        guidance_embedding,
        config.guidance_scale,
    );
    for adapter in adapters {
        pnp.add_adapter(adapter)
    }
    pnp.register_injection(
        injection_steps(config.n_timesteps, config.pnp_f_t),
        injection_steps(config.n_timesteps, config.pnp_attn_t),
    );

    let latents = pnp.initial_latent()?;
    let latents = with_precision(device, || pnp.sample_loop(latents))?;
    let image = tch::no_grad(|| with_precision(device, || decode_latents(&vae, &latents)));
    let output = config.output_image_path();
    save_image(&image, &output)?;
    info!("image saved to {}", output.display());
    Ok(output)
}
