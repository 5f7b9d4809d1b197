//! # Models
//!
//! The denoising UNet with its adapter and injection hooks, and the perceptual feature
//! extractor used by the style loss. The autoencoder and the text encoder are the
//! pretrained diffusers-rs ones.

pub mod attention;
pub mod lora;
pub mod resnet;
pub mod unet_2d;
pub mod unet_2d_blocks;
pub mod vgg;
