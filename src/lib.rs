//! # Plug-and-play diffusion editing with regional LoRA styles
//!
//! This crate implements two workflows on top of Stable Diffusion, using Torch via
//! [tch-rs](https://github.com/LaurentMazare/tch-rs) and the pretrained building blocks of
//! [diffusers-rs](https://github.com/LaurentMazare/diffusers-rs):
//! - Plug-and-play editing: the structure of a source image is carried into a new
//!   generation by injecting the source trajectory's convolution features and
//!   self-attention queries/keys into the denoising UNet, while per-region LoRA adapted
//!   UNets paint their own style inside a spatial mask.
//! - LoRA fine-tuning of the UNet on a single image, combined with a Gram matrix style
//!   loss against a reference style image.

pub mod config;
mod error;
pub mod models;
pub mod pipelines;
pub mod pnp;
pub mod training;
pub mod utils;

pub use error::Error;
