//! The plug-and-play denoising loop.
use crate::models::unet_2d::UNet2DConditionModel;
use crate::pnp::adapters::StyleAdapter;
use crate::pnp::injection::InjectionSchedule;
use crate::pnp::latents::SourceLatentStore;
use crate::utils::progress_bar;
use diffusers::schedulers::ddim::DDIMScheduler;
use std::sync::Arc;
use tch::Tensor;

/// `uncond + scale * (cond - uncond)`, written so that a scale of 0 returns `uncond` and a
/// scale of 1 returns `cond` without rounding.
pub fn classifier_free_guidance(uncond: &Tensor, cond: &Tensor, guidance_scale: f64) -> Tensor {
    uncond * (1. - guidance_scale) + cond * guidance_scale
}

pub struct PlugAndPlay {
    unet: UNet2DConditionModel,
    adapters: Vec<StyleAdapter>,
    scheduler: DDIMScheduler,
    source_latents: SourceLatentStore,
    /// `[unconditional, conditional]` embedding of the edit prompt.
    text_embeddings: Tensor,
    /// Conditioning of the source slot of the batch.
    guidance_embedding: Tensor,
    guidance_scale: f64,
    injection: Option<Arc<InjectionSchedule>>,
}

impl PlugAndPlay {
    pub fn new(
        unet: UNet2DConditionModel,
        scheduler: DDIMScheduler,
        source_latents: SourceLatentStore,
        text_embeddings: Tensor,
        guidance_embedding: Tensor,
        guidance_scale: f64,
    ) -> Self {
        Self {
            unet,
            adapters: vec![],
            scheduler,
            source_latents,
            text_embeddings,
            guidance_embedding,
            guidance_scale,
            injection: None,
        }
    }

    pub fn timesteps(&self) -> &[usize] {
        self.scheduler.timesteps()
    }

    pub fn adapters(&self) -> &[StyleAdapter] {
        &self.adapters
    }

    pub fn injection_schedule(&self) -> Option<&Arc<InjectionSchedule>> {
        self.injection.as_ref()
    }

    /// Adapters are blended in the order they are added. An adapter added after
    /// [`Self::register_injection`] receives the same schedule as the base network.
    pub fn add_adapter(&mut self, mut adapter: StyleAdapter) {
        if let Some(schedule) = &self.injection {
            adapter.unet.register_injection(schedule.clone())
        }
        self.adapters.push(adapter)
    }

    /// Injects conv features during the first `conv_steps` timesteps and self-attention
    /// queries/keys during the first `qk_steps`, on the base network and every adapter.
    /// Negative counts disable the respective injection.
    pub fn register_injection(&mut self, conv_steps: i64, qk_steps: i64) -> Arc<InjectionSchedule> {
        let schedule = Arc::new(InjectionSchedule::new(self.timesteps(), conv_steps, qk_steps));
        log::info!(
            "injecting conv features for {} and attention for {} of {} timesteps",
            schedule.conv_timesteps().len(),
            schedule.qk_timesteps().len(),
            self.timesteps().len()
        );
        self.unet.register_injection(schedule.clone());
        for adapter in self.adapters.iter_mut() {
            adapter.unet.register_injection(schedule.clone())
        }
        self.injection = Some(schedule.clone());
        schedule
    }

    /// The starting point of the loop: the source latent cached for the first timestep.
    pub fn initial_latent(&self) -> anyhow::Result<Tensor> {
        match self.timesteps().first() {
            Some(&timestep) => self.source_latents.load(timestep),
            None => anyhow::bail!("the scheduler has no timesteps"),
        }
    }

    /// One transition of the loop: the denoised latent for timestep `timestep` given the
    /// current latent `xs`.
    pub fn denoise_step(&self, xs: &Tensor, timestep: usize) -> anyhow::Result<Tensor> {
        let source = self.source_latents.load(timestep)?;
        // The source slot only feeds the injected layers, its prediction is dropped.
        let latent_model_input = Tensor::cat(&[&source, xs, xs], 0);
        let text_embeddings = Tensor::cat(&[&self.guidance_embedding, &self.text_embeddings], 0);
        let mut noise_pred = self.unet.forward_at(&latent_model_input, timestep, &text_embeddings);
        for adapter in self.adapters.iter() {
            let text_embeddings =
                Tensor::cat(&[&self.guidance_embedding, &adapter.text_embeddings], 0);
            let adapter_pred = adapter.unet.forward_at(&latent_model_input, timestep, &text_embeddings);
            noise_pred = adapter.blend(&noise_pred, &adapter_pred);
        }
        let noise_pred = noise_pred.chunk(3, 0);
        let noise_pred = classifier_free_guidance(&noise_pred[1], &noise_pred[2], self.guidance_scale);
        Ok(self.scheduler.step(&noise_pred, timestep, xs))
    }

    /// Runs every timestep of the schedule in order, without gradients, and returns the
    /// final latent.
    pub fn sample_loop(&self, xs: Tensor) -> anyhow::Result<Tensor> {
        let _guard = tch::no_grad_guard();
        let pb = progress_bar(self.timesteps().len() as u64, "sampling");
        let mut xs = xs;
        for &timestep in self.timesteps().iter() {
            xs = self.denoise_step(&xs, timestep)?;
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(xs)
    }
}
