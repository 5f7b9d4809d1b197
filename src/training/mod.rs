//! # LoRA training
//!
//! Fine-tunes low-rank adapters of the UNet on a single image, adding a Gram matrix style
//! loss against a reference image. The resulting adapters are the style models used by
//! the plug-and-play editing workflow.
pub mod lora_trainer;
pub mod noise;
pub mod plots;
pub mod schedule;
pub mod style_loss;

pub use lora_trainer::{train_lora, LoraTrainer, TrainArgs, TrainConfig, TrainingLog};
pub use noise::NoiseSchedule;
pub use schedule::LrSchedule;
pub use style_loss::StyleLoss;
