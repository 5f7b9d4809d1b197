// Plug-and-play editing of a source image with regional LoRA styles.
//
// The source latents are expected under `<latents_path>/<image name>/noisy_latents_<t>.pt`
// for every timestep of the DDIM schedule, and the pretrained weights are local files
// listed in the `weights` section of the config, e.g.
//
// weights:
//   unet: data/unet.safetensors
//   vae: data/vae.safetensors
//   clip: data/clip.safetensors
//   vocab: data/bpe_simple_vocab_16e6.txt
use clap::Parser;
use diffstyler::config::PnpConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// The YAML run configuration.
    #[arg(long, value_name = "FILE", default_value = "configs/config.yaml")]
    config_path: String,
}

fn main() -> anyhow::Result<()> {
    diffstyler::utils::init_logger();
    let args = Args::parse();
    let config = PnpConfig::load(&args.config_path)?;
    log::info!("{config:?}");
    let output = diffstyler::pnp::edit::run(&config)?;
    println!("{}", output.display());
    Ok(())
}
