//! Single image LoRA fine-tuning of the UNet with an additional style loss.
//!
//! The adapters are trained on the usual denoising objective: noise is added to the
//! latent of the training image at a random timestep and the UNet predicts it back. The
//! style term compares Gram matrices of VGG-19 features of the decoded training latent
//! with those of a reference style image. Each step logs its loss and duration.
use crate::models::lora::LoraConfig;
use crate::models::unet_2d::UNet2DConditionModel;
use crate::models::vgg::Vgg19Features;
use crate::pipelines::stable_diffusion::{decode_latents, ModelVersion, StableDiffusionConfig, VAE_SCALE};
use crate::pnp::embeddings::TextEmbedder;
use crate::training::noise::NoiseSchedule;
use crate::training::plots::{load_font, save_line_plot, system_font, PlotLabels};
use crate::training::schedule::LrSchedule;
use crate::training::style_loss::{StyleLoss, DEFAULT_STYLE_LAYERS};
use crate::utils::{load_image, load_image_shorter_side, progress_bar, require_file};
use diffusers::models::vae::AutoEncoderKL;
use diffusers::schedulers::PredictionType;
use log::{info, warn};
use rusttype::Font;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tch::nn::OptimizerConfig;
use tch::{nn, Device, Kind, Tensor};

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub steps: usize,
    pub lr: f64,
    pub rank: i64,
    /// Multiplier of the style term, 0 trains on the denoising loss alone.
    pub style_weight: f64,
    pub style_layers: Vec<(usize, f64)>,
    pub lr_schedule: LrSchedule,
    pub seed: i64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub weight_decay: f64,
    pub adam_eps: f64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            steps: 200,
            lr: 2e-4,
            rank: 16,
            style_weight: 1e4,
            style_layers: DEFAULT_STYLE_LAYERS.to_vec(),
            lr_schedule: LrSchedule::Constant,
            seed: 0,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            weight_decay: 1e-2,
            adam_eps: 1e-8,
        }
    }
}

/// Per step loss and wall clock time, in seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingLog {
    pub loss: Vec<f64>,
    pub step_time: Vec<f64>,
    pub cumulative_time: Vec<f64>,
}

impl TrainingLog {
    pub fn record(&mut self, loss: f64, step_time: f64) {
        let total = self.cumulative_time.last().copied().unwrap_or(0.) + step_time;
        self.loss.push(loss);
        self.step_time.push(step_time);
        self.cumulative_time.push(total);
    }

    pub fn len(&self) -> usize {
        self.loss.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loss.is_empty()
    }

    /// Writes `training_log.json` and the `training_loss.png`, `training_time.png` and
    /// `cumulative_time.png` plots into `dir`. Plots are captioned when a font is given.
    pub fn save<P: AsRef<Path>>(&self, dir: P, font: Option<&Font>) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        let file = std::fs::File::create(dir.join("training_log.json"))?;
        serde_json::to_writer_pretty(file, self)?;
        let plots = [
            (
                &self.loss,
                "training_loss.png",
                PlotLabels {
                    title: "Training Loss over Iterations",
                    x_label: "Iterations",
                    y_label: "Loss",
                    legend: "Training Loss",
                },
            ),
            (
                &self.step_time,
                "training_time.png",
                PlotLabels {
                    title: "Time Taken per Iteration",
                    x_label: "Iterations",
                    y_label: "Time (s)",
                    legend: "Time per Iteration",
                },
            ),
            (
                &self.cumulative_time,
                "cumulative_time.png",
                PlotLabels {
                    title: "Cumulative Time over Iterations",
                    x_label: "Iterations",
                    y_label: "Cumulative Time (s)",
                    legend: "Cumulative Time",
                },
            ),
        ];
        for (values, name, labels) in plots.iter() {
            save_line_plot(values, labels, font, dir.join(name))?;
        }
        Ok(())
    }
}

pub struct LoraTrainer {
    unet: UNet2DConditionModel,
    lora_vs: nn::VarStore,
    vae: AutoEncoderKL,
    vgg: Vgg19Features,
    noise_schedule: NoiseSchedule,
    config: TrainConfig,
}

impl LoraTrainer {
    /// `unet` must have been built with its adapters in `lora_vs`, the only variables
    /// updated by the optimizer.
    pub fn new(
        unet: UNet2DConditionModel,
        lora_vs: nn::VarStore,
        vae: AutoEncoderKL,
        vgg: Vgg19Features,
        noise_schedule: NoiseSchedule,
        config: TrainConfig,
    ) -> Self {
        Self { unet, lora_vs, vae, vgg, noise_schedule, config }
    }

    pub fn lora_vs(&self) -> &nn::VarStore {
        &self.lora_vs
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    fn style_term(&self, style_loss: &StyleLoss, model_input: &Tensor, style_size: (i64, i64)) -> Tensor {
        tch::no_grad(|| {
            let recon = decode_latents(&self.vae, model_input);
            let size = recon.size();
            let recon = if (size[2], size[3]) == style_size {
                recon
            } else {
                recon.upsample_bilinear2d([style_size.0, style_size.1], false, None, None)
            };
            style_loss.loss(&self.vgg, &recon)
        })
    }

    /// Trains the adapters on `image` (values in `[-1, 1]`), conditioned on
    /// `text_embedding`. When `style_image` (values in `[0, 1]`) is given, the weighted
    /// style term is added to every step's loss.
    pub fn train(
        &self,
        image: &Tensor,
        style_image: Option<&Tensor>,
        text_embedding: &Tensor,
    ) -> anyhow::Result<TrainingLog> {
        let config = &self.config;
        tch::manual_seed(config.seed);
        let device = self.lora_vs.device();
        let mut opt = nn::AdamW {
            beta1: config.adam_beta1,
            beta2: config.adam_beta2,
            wd: config.weight_decay,
            eps: config.adam_eps,
            amsgrad: false,
        }
        .build(&self.lora_vs, config.lr)?;

        let latent_dist = tch::no_grad(|| self.vae.encode(image));
        let style = match style_image {
            Some(style_image) => {
                let size = style_image.size();
                let style_size = (size[size.len() - 2], size[size.len() - 1]);
                Some((StyleLoss::new(&self.vgg, style_image, &config.style_layers), style_size))
            }
            None => None,
        };

        let pb = progress_bar(config.steps as u64, "training LoRA");
        let mut log = TrainingLog::default();
        for step in 0..config.steps {
            let start = Instant::now();
            opt.set_lr(config.lr_schedule.lr(config.lr, step, config.steps));
            let model_input = tch::no_grad(|| latent_dist.sample() * VAE_SCALE);
            let noise = model_input.randn_like();
            let timestep = self.noise_schedule.sample_timestep(device);
            let noisy_model_input = self.noise_schedule.add_noise(&model_input, &noise, timestep);
            let model_pred = self.unet.forward(&noisy_model_input, timestep as f64, text_embedding);
            let target = self.noise_schedule.target(&model_input, &noise, timestep)?;
            let loss = model_pred
                .to_kind(Kind::Float)
                .mse_loss(&target.to_kind(Kind::Float), tch::Reduction::Mean);
            let loss = match &style {
                Some((style_loss, style_size)) => {
                    let style_term = self.style_term(style_loss, &model_input, *style_size);
                    loss + style_term * config.style_weight
                }
                None => loss,
            };
            opt.backward_step(&loss);
            let loss = loss.double_value(&[]);
            log.record(loss, start.elapsed().as_secs_f64());
            log::debug!("step {step} timestep {timestep} loss {loss}");
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(log)
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        self.lora_vs.save(path)?;
        Ok(())
    }
}

/// Everything read from disk by [`train_lora`].
#[derive(Debug, Clone)]
pub struct TrainArgs {
    pub image_path: PathBuf,
    pub style_image_path: PathBuf,
    pub prompt: String,
    pub version: ModelVersion,
    pub output_dir: PathBuf,
    pub unet_weights: PathBuf,
    pub vae_weights: PathBuf,
    pub clip_weights: PathBuf,
    pub vocab_file: PathBuf,
    pub vgg_weights: PathBuf,
    pub device: Device,
    /// Overrides the prediction type of the model version.
    pub prediction_type: Option<PredictionType>,
    /// TrueType font for the plot captions, a system font is looked up when absent.
    pub plot_font: Option<PathBuf>,
    pub config: TrainConfig,
}

#[derive(Debug)]
pub struct TrainOutputs {
    pub weights: PathBuf,
    pub log: TrainingLog,
}

/// `lora_<image file stem>.safetensors`.
pub fn weights_file_name<P: AsRef<Path>>(image_path: P) -> anyhow::Result<String> {
    let image_path = image_path.as_ref();
    match image_path.file_stem() {
        Some(stem) => Ok(format!("lora_{}.safetensors", stem.to_string_lossy())),
        None => anyhow::bail!("cannot derive an image name from {}", image_path.display()),
    }
}

/// Builds the frozen UNet with fresh adapters of rank `config.rank`. The adapter
/// weights are drawn after seeding with `config.seed`.
pub fn init_adapters<P: AsRef<Path>>(
    sd_config: &StableDiffusionConfig,
    unet_weights: P,
    device: Device,
    config: &TrainConfig,
) -> anyhow::Result<(UNet2DConditionModel, nn::VarStore)> {
    tch::manual_seed(config.seed);
    let lora_config = LoraConfig { rank: config.rank, ..Default::default() };
    let store = sd_config.build_trainable_unet(unet_weights, device, lora_config)?;
    match store.lora_vs {
        Some(lora_vs) => Ok((store.unet, lora_vs)),
        None => anyhow::bail!("the trainable UNet has no adapters"),
    }
}

/// Trains adapters on one image and writes the weights, the training log and its plots
/// into the output directory.
pub fn train_lora(args: &TrainArgs) -> anyhow::Result<TrainOutputs> {
    let sd_config = StableDiffusionConfig::for_version(args.version, None);
    let device = args.device;
    let weights_name = weights_file_name(&args.image_path)?;
    std::fs::create_dir_all(&args.output_dir)?;

    let (height, width) = (sd_config.height, sd_config.width);
    // Latent sides have to survive the three UNet downsamplings.
    let image = load_image_shorter_side(&args.image_path, height.min(width), 64)?.to(device) * 2. - 1.;
    let style_image = load_image(&args.style_image_path, width, height)?.to(device);

    info!("loading Stable Diffusion {} on {device:?}", args.version);
    let tokenizer = sd_config.build_tokenizer(&args.vocab_file)?;
    let text_model = sd_config.build_clip_transformer(&args.clip_weights, device)?;
    let text_embedding = TextEmbedder::new(tokenizer, text_model, device).encode(&args.prompt)?;

    let (unet, lora_vs) = init_adapters(&sd_config, &args.unet_weights, device, &args.config)?;
    info!("training {} adapter tensors", lora_vs.trainable_variables().len());
    let vae = sd_config.build_vae(&args.vae_weights, device)?;

    let vgg_weights = require_file("vgg weights", &args.vgg_weights)?;
    let mut vgg_vs = nn::VarStore::new(device);
    let vgg = Vgg19Features::new(vgg_vs.root());
    vgg_vs.load(&vgg_weights)?;
    vgg_vs.freeze();

    let mut noise_schedule = NoiseSchedule::from_ddim(&sd_config.scheduler);
    if let Some(prediction_type) = args.prediction_type {
        noise_schedule = noise_schedule.with_prediction_type(prediction_type);
    }

    let trainer = LoraTrainer::new(unet, lora_vs, vae, vgg, noise_schedule, args.config.clone());
    let log = trainer.train(&image, Some(&style_image), &text_embedding)?;

    let weights = args.output_dir.join(weights_name);
    trainer.save_weights(&weights)?;
    let font = match &args.plot_font {
        Some(path) => Some(load_font(path)?),
        None => match system_font() {
            Some((path, font)) => {
                info!("plot captions use {}", path.display());
                Some(font)
            }
            None => {
                warn!("no font found, plots are written without captions");
                None
            }
        },
    };
    log.save(&args.output_dir, font.as_ref())?;
    info!("adapter weights saved to {}", weights.display());
    Ok(TrainOutputs { weights, log })
}
