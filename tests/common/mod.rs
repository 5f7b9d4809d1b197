#![allow(dead_code)]
use diffstyler::models::lora::{LoraConfig, LoraPath};
use diffstyler::models::unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig};
use diffusers::models::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use tch::{nn, Device, Kind, Tensor};

pub const CONTEXT_DIM: i64 = 16;
pub const CONTEXT_LEN: i64 = 5;

pub fn tiny_unet_config() -> UNet2DConditionModelConfig {
    UNet2DConditionModelConfig {
        blocks: vec![
            BlockConfig { out_channels: 32, use_cross_attn: true, attention_head_dim: 4 },
            BlockConfig { out_channels: 32, use_cross_attn: false, attention_head_dim: 4 },
        ],
        cross_attention_dim: CONTEXT_DIM,
        ..Default::default()
    }
}

pub fn tiny_unet(seed: i64) -> (nn::VarStore, UNet2DConditionModel) {
    tch::manual_seed(seed);
    let vs = nn::VarStore::new(Device::Cpu);
    let unet = UNet2DConditionModel::new(vs.root(), LoraPath::none(), 4, 4, tiny_unet_config());
    (vs, unet)
}

/// A network with the same base weights as `base`, never sharing storage with it.
pub fn copy_unet(base: &nn::VarStore) -> UNet2DConditionModel {
    let mut vs = nn::VarStore::new(Device::Cpu);
    let unet = UNet2DConditionModel::new(vs.root(), LoraPath::none(), 4, 4, tiny_unet_config());
    vs.copy(base).unwrap();
    unet
}

/// A copy of `base` carrying adapters. The adapters are randomized so that they change
/// the predictions, or copied from `lora_weights` when given.
pub fn adapted_unet(
    base: &nn::VarStore,
    lora_weights: Option<&nn::VarStore>,
) -> (nn::VarStore, UNet2DConditionModel) {
    let mut lora_vs = nn::VarStore::new(Device::Cpu);
    let mut vs = nn::VarStore::new(Device::Cpu);
    let lora = LoraPath::new(lora_vs.root(), LoraConfig { rank: 4, scale: 1. });
    let unet = UNet2DConditionModel::new(vs.root(), lora, 4, 4, tiny_unet_config());
    vs.copy(base).unwrap();
    match lora_weights {
        Some(weights) => lora_vs.copy(weights).unwrap(),
        None => tch::no_grad(|| {
            for (_, mut var) in lora_vs.variables() {
                let _ = var.copy_(&(var.randn_like() * 0.1));
            }
        }),
    }
    (lora_vs, unet)
}

pub fn trainable_unet(seed: i64) -> (nn::VarStore, nn::VarStore, UNet2DConditionModel) {
    tch::manual_seed(seed);
    let lora_vs = nn::VarStore::new(Device::Cpu);
    let mut vs = nn::VarStore::new(Device::Cpu);
    let lora = LoraPath::new(lora_vs.root(), LoraConfig { rank: 4, scale: 1. });
    let unet = UNet2DConditionModel::new(vs.root(), lora, 4, 4, tiny_unet_config());
    vs.freeze();
    (vs, lora_vs, unet)
}

/// An autoencoder without downsampling: 16x16 images map to 16x16 latents.
pub fn tiny_vae() -> AutoEncoderKL {
    let vs = nn::VarStore::new(Device::Cpu);
    let config = AutoEncoderKLConfig {
        block_out_channels: vec![32],
        layers_per_block: 1,
        latent_channels: 4,
        norm_num_groups: 32,
    };
    AutoEncoderKL::new(vs.root(), 3, 3, config)
}

pub fn embeddings(batch: i64) -> Tensor {
    Tensor::randn([batch, CONTEXT_LEN, CONTEXT_DIM], (Kind::Float, Device::Cpu))
}

pub fn latent() -> Tensor {
    Tensor::randn([1, 4, 8, 8], (Kind::Float, Device::Cpu))
}
