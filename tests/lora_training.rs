mod common;

use common::*;
use diffstyler::models::vgg::Vgg19Features;
use diffstyler::pipelines::stable_diffusion::{ModelVersion, StableDiffusionConfig};
use diffstyler::training::lora_trainer::init_adapters;
use diffstyler::training::{LoraTrainer, NoiseSchedule, TrainConfig, TrainingLog};
use diffstyler::Error;
use diffusers::schedulers::{BetaSchedule, PredictionType};
use tch::{nn, Device, Kind, Tensor};

fn config(style_weight: f64) -> TrainConfig {
    TrainConfig {
        steps: 3,
        lr: 1e-3,
        rank: 4,
        style_weight,
        style_layers: vec![(0, 1.0), (5, 0.75)],
        seed: 11,
        ..Default::default()
    }
}

fn trainer(config: TrainConfig, prediction_type: PredictionType) -> LoraTrainer {
    let (_vs, lora_vs, unet) = trainable_unet(5);
    let vae = tiny_vae();
    let vgg_vs = nn::VarStore::new(Device::Cpu);
    let vgg = Vgg19Features::new(vgg_vs.root());
    let noise = NoiseSchedule::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, prediction_type);
    LoraTrainer::new(unet, lora_vs, vae, vgg, noise, config)
}

struct Inputs {
    image: Tensor,
    style: Tensor,
    text: Tensor,
}

fn inputs() -> Inputs {
    tch::manual_seed(9);
    let opts = (Kind::Float, Device::Cpu);
    Inputs {
        image: Tensor::rand([1, 3, 16, 16], opts) * 2. - 1.,
        style: Tensor::rand([1, 3, 16, 16], opts),
        text: embeddings(1),
    }
}

fn train(config: TrainConfig, with_style: bool) -> TrainingLog {
    let inputs = inputs();
    let trainer = trainer(config, PredictionType::Epsilon);
    let style = if with_style { Some(&inputs.style) } else { None };
    trainer.train(&inputs.image, style, &inputs.text).unwrap()
}

#[test]
fn training_updates_only_the_adapters() {
    let inputs = inputs();
    let trainer = trainer(config(1e4), PredictionType::Epsilon);
    let up_norm = |trainer: &LoraTrainer| -> f64 {
        trainer
            .lora_vs()
            .variables()
            .iter()
            .filter(|(name, _)| name.ends_with("up.weight"))
            .map(|(_, var)| var.abs().sum(Kind::Float).double_value(&[]))
            .sum()
    };
    assert_eq!(up_norm(&trainer), 0.);
    let log = trainer.train(&inputs.image, Some(&inputs.style), &inputs.text).unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.loss.iter().all(|l| l.is_finite()));
    assert!(log.cumulative_time.windows(2).all(|w| w[1] >= w[0]));
    assert!(up_norm(&trainer) > 0.);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lora_test.safetensors");
    trainer.save_weights(&path).unwrap();
    let weights = diffstyler::models::lora::read_weights(&path).unwrap();
    assert!(weights
        .keys()
        .any(|k| k.starts_with("up_blocks.1.attentions.0.transformer_blocks.0.attn1.processor.to_q_lora")));
}

#[test]
fn zero_style_weight_matches_training_without_style() {
    let without_style = train(config(1e4), false);
    let zero_weight = train(config(0.), true);
    assert_eq!(without_style.loss, zero_weight.loss);

    let with_style = train(config(1e4), true);
    assert!(with_style.loss[0] > without_style.loss[0]);
}

#[test]
fn velocity_targets_train() {
    let inputs = inputs();
    let trainer = trainer(config(0.), PredictionType::VPrediction);
    let log = trainer.train(&inputs.image, None, &inputs.text).unwrap();
    assert!(log.loss.iter().all(|l| l.is_finite()));
}

#[test]
fn sample_prediction_is_rejected() {
    let inputs = inputs();
    let trainer = trainer(config(0.), PredictionType::Sample);
    let err = trainer.train(&inputs.image, None, &inputs.text).unwrap_err();
    assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnsupportedPredictionType(_))));
}

#[test]
fn adapters_start_from_the_seed() {
    let dir = tempfile::tempdir().unwrap();
    let unet_weights = dir.path().join("unet.safetensors");
    let (base_vs, _) = tiny_unet(0);
    base_vs.save(&unet_weights).unwrap();
    let mut sd_config = StableDiffusionConfig::for_version(ModelVersion::V1_5, None);
    sd_config.unet = tiny_unet_config();

    let adapters = |seed: i64| {
        let train_config = TrainConfig { seed, ..config(0.) };
        let (_, lora_vs) = init_adapters(&sd_config, &unet_weights, Device::Cpu, &train_config).unwrap();
        // Moves the global generator between runs.
        let _ = Tensor::randn([16], (Kind::Float, Device::Cpu));
        let mut variables: Vec<_> = lora_vs.variables().into_iter().collect();
        variables.sort_by(|a, b| a.0.cmp(&b.0));
        variables
    };
    let first = adapters(3);
    let second = adapters(3);
    assert!(!first.is_empty());
    assert_eq!(first.len(), second.len());
    for ((name, a), (other, b)) in first.iter().zip(second.iter()) {
        assert_eq!(name, other);
        assert!(a.equal(b), "{name}");
    }
    let reseeded = adapters(4);
    assert!(first.iter().zip(reseeded.iter()).any(|((_, a), (_, b))| !a.equal(b)));
}
