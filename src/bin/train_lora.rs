// Trains a LoRA style adapter on a single image, with a VGG-19 Gram matrix loss against a
// style image. The resulting `lora_<image name>.safetensors` can be referenced from the
// `lora_configs` of a plug-and-play run.
use clap::Parser;
use diffstyler::pipelines::stable_diffusion::ModelVersion;
use diffstyler::training::{noise::parse_prediction_type, train_lora, LrSchedule, TrainArgs, TrainConfig};
use diffstyler::utils::parse_device;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The image the adapter is trained on.
    #[arg(long, value_name = "FILE", default_value = "data/girl_c1.jpg")]
    image_path: String,

    /// The reference image for the style loss.
    #[arg(long, value_name = "FILE")]
    style_image_path: String,

    #[arg(long, default_value = "cartoon image, woman")]
    prompt: String,

    /// Stable Diffusion version, 1.5, 2.0 or 2.1.
    #[arg(long, default_value = "2.1")]
    model_version: String,

    #[arg(long, value_name = "DIR", default_value = "lora_models")]
    output_dir: String,

    #[arg(long, value_name = "FILE", default_value = "data/unet.safetensors")]
    unet_weights: String,

    #[arg(long, value_name = "FILE", default_value = "data/vae.safetensors")]
    vae_weights: String,

    #[arg(long, value_name = "FILE", default_value = "data/clip.safetensors")]
    clip_weights: String,

    #[arg(long, value_name = "FILE", default_value = "data/bpe_simple_vocab_16e6.txt")]
    vocab_file: String,

    /// torchvision VGG-19 weights, converted to safetensors.
    #[arg(long, value_name = "FILE", default_value = "data/vgg19.safetensors")]
    vgg_weights: String,

    /// cpu, cuda, cuda:<n> or mps.
    #[arg(long, default_value = "cuda")]
    device: String,

    #[arg(long, default_value_t = 200)]
    steps: usize,

    #[arg(long, default_value_t = 2e-4)]
    lr: f64,

    #[arg(long, default_value_t = 16)]
    rank: i64,

    #[arg(long, default_value_t = 1e4)]
    style_weight: f64,

    /// constant, constant_with_warmup:<steps> or linear[:<warmup steps>].
    #[arg(long, default_value = "constant")]
    lr_schedule: String,

    #[arg(long, default_value_t = 0)]
    seed: i64,

    /// Overrides the model's prediction type, epsilon or v_prediction.
    #[arg(long)]
    prediction_type: Option<String>,

    /// TrueType font for the plot captions, a system font is used when absent.
    #[arg(long, value_name = "FILE")]
    plot_font: Option<String>,
}

fn main() -> anyhow::Result<()> {
    diffstyler::utils::init_logger();
    let args = Args::parse();
    let version: ModelVersion = args.model_version.parse()?;
    let prediction_type = args.prediction_type.as_deref().map(parse_prediction_type).transpose()?;
    let config = TrainConfig {
        steps: args.steps,
        lr: args.lr,
        rank: args.rank,
        style_weight: args.style_weight,
        lr_schedule: args.lr_schedule.parse::<LrSchedule>()?,
        seed: args.seed,
        ..Default::default()
    };
    let train_args = TrainArgs {
        image_path: args.image_path.into(),
        style_image_path: args.style_image_path.into(),
        prompt: args.prompt,
        version,
        output_dir: args.output_dir.into(),
        unet_weights: args.unet_weights.into(),
        vae_weights: args.vae_weights.into(),
        clip_weights: args.clip_weights.into(),
        vocab_file: args.vocab_file.into(),
        vgg_weights: args.vgg_weights.into(),
        device: parse_device(&args.device)?,
        prediction_type,
        plot_font: args.plot_font.map(Into::into),
        config,
    };
    let outputs = train_lora(&train_args)?;
    println!("{}", outputs.weights.display());
    Ok(())
}
