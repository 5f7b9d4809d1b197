mod common;

use common::*;
use diffstyler::models::unet_2d::UNet2DConditionModel;
use diffstyler::pnp::{PlugAndPlay, SourceLatentStore, StyleAdapter};
use diffstyler::Error;
use diffusers::schedulers::ddim::DDIMScheduler;
use std::sync::Arc;
use tch::{Device, Kind, Tensor};

// Two DDIM steps over 1000 training steps: timesteps [501, 1].
fn scheduler() -> DDIMScheduler {
    DDIMScheduler::new(2, Default::default())
}

struct Fixture {
    dir: tempfile::TempDir,
    text_embeddings: Tensor,
    guidance_embedding: Tensor,
}

impl Fixture {
    /// Writes source latents for the given timesteps, the first one without a batch
    /// dimension.
    fn new(timesteps: &[usize]) -> Self {
        tch::manual_seed(42);
        let dir = tempfile::tempdir().unwrap();
        let store = SourceLatentStore::new(dir.path(), "source.png", Device::Cpu).unwrap();
        std::fs::create_dir_all(store.dir()).unwrap();
        for (i, &t) in timesteps.iter().enumerate() {
            let latent = latent();
            let latent = if i == 0 { latent.squeeze_dim(0) } else { latent };
            latent.save(store.path_for(t)).unwrap();
        }
        Self { dir, text_embeddings: embeddings(2), guidance_embedding: embeddings(1) }
    }

    fn store(&self) -> SourceLatentStore {
        SourceLatentStore::new(self.dir.path(), "source.png", Device::Cpu).unwrap()
    }

    fn pipeline(&self, unet: UNet2DConditionModel, guidance_scale: f64) -> PlugAndPlay {
        PlugAndPlay::new(
            unet,
            scheduler(),
            self.store(),
            self.text_embeddings.shallow_clone(),
            self.guidance_embedding.shallow_clone(),
            guidance_scale,
        )
    }
}

fn mask(value: f64) -> Tensor {
    Tensor::ones([1, 1, 8, 8], (Kind::Float, Device::Cpu)) * value
}

fn run(pnp: &PlugAndPlay) -> Tensor {
    let initial = pnp.initial_latent().unwrap();
    pnp.sample_loop(initial).unwrap()
}

#[test]
fn zero_mask_adapter_leaves_output_unchanged() {
    let fixture = Fixture::new(&[501, 1]);
    let (base_vs, _) = tiny_unet(0);

    let mut plain = fixture.pipeline(copy_unet(&base_vs), 7.5);
    plain.register_injection(2, 2);

    let mut with_adapter = fixture.pipeline(copy_unet(&base_vs), 7.5);
    let (_lora_vs, adapter_unet) = adapted_unet(&base_vs, None);
    with_adapter.add_adapter(StyleAdapter::new(adapter_unet, mask(0.), embeddings(2)));
    with_adapter.register_injection(2, 2);

    assert!(run(&plain).equal(&run(&with_adapter)));
}

#[test]
fn one_mask_adapter_replaces_base_prediction() {
    let fixture = Fixture::new(&[501, 1]);
    let (base_vs, _) = tiny_unet(0);
    let (lora_vs, adapter_unet) = adapted_unet(&base_vs, None);
    let adapter_embeddings = embeddings(2);

    let mut blended = fixture.pipeline(copy_unet(&base_vs), 7.5);
    blended.add_adapter(StyleAdapter::new(adapter_unet, mask(1.), adapter_embeddings.shallow_clone()));

    // The adapted network alone, conditioned on the adapter prompt.
    let (_, same_adapter) = adapted_unet(&base_vs, Some(&lora_vs));
    let alone = PlugAndPlay::new(
        same_adapter,
        scheduler(),
        fixture.store(),
        adapter_embeddings,
        fixture.guidance_embedding.shallow_clone(),
        7.5,
    );

    let xs = fixture.store().load(501).unwrap();
    let _guard = tch::no_grad_guard();
    let expected = alone.denoise_step(&xs, 501).unwrap();
    let actual = blended.denoise_step(&xs, 501).unwrap();
    assert!(actual.allclose(&expected, 1e-5, 1e-6, false));
}

#[test]
fn unit_guidance_ignores_the_unconditional_prediction() {
    let fixture = Fixture::new(&[501, 1]);
    let (base_vs, _) = tiny_unet(0);
    let mut reference = fixture.pipeline(copy_unet(&base_vs), 1.0);
    reference.register_injection(1, 1);

    let cond = fixture.text_embeddings.narrow(0, 1, 1);
    let other_uncond = Tensor::cat(&[embeddings(1), cond], 0);
    let mut other = PlugAndPlay::new(
        copy_unet(&base_vs),
        scheduler(),
        fixture.store(),
        other_uncond,
        fixture.guidance_embedding.shallow_clone(),
        1.0,
    );
    other.register_injection(1, 1);
    assert!(run(&reference).allclose(&run(&other), 1e-6, 1e-7, false));
}

#[test]
fn steps_read_the_latent_of_their_own_timestep() {
    let fixture = Fixture::new(&[501]);
    let (base_vs, _) = tiny_unet(0);
    let pnp = fixture.pipeline(copy_unet(&base_vs), 7.5);
    let xs = latent();
    let _guard = tch::no_grad_guard();
    let before = pnp.denoise_step(&xs, 501).unwrap();

    // Adding the other timestep's latent does not change the step at 501.
    latent().save(fixture.store().path_for(1)).unwrap();
    let after = pnp.denoise_step(&xs, 501).unwrap();
    assert!(before.equal(&after));

    // Replacing the latent at 501 does.
    (latent() * 3.).save(fixture.store().path_for(501)).unwrap();
    let replaced = pnp.denoise_step(&xs, 501).unwrap();
    assert!(!before.equal(&replaced));
}

#[test]
fn missing_latent_aborts_at_its_timestep() {
    let fixture = Fixture::new(&[501]);
    let (base_vs, _) = tiny_unet(0);
    let mut pnp = fixture.pipeline(copy_unet(&base_vs), 7.5);
    pnp.register_injection(2, 2);
    let initial = pnp.initial_latent().unwrap();
    assert_eq!(initial.size(), [1, 4, 8, 8]);
    let err = pnp.sample_loop(initial).unwrap_err();
    match err.downcast_ref::<Error>() {
        Some(Error::MissingSourceLatent { timestep, path }) => {
            assert_eq!(*timestep, 1);
            assert!(path.ends_with("source/noisy_latents_1.pt"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn sampling_is_deterministic() {
    let fixture = Fixture::new(&[501, 1]);
    let build = || {
        let (base_vs, _) = tiny_unet(3);
        let mut pnp = fixture.pipeline(copy_unet(&base_vs), 7.5);
        let (_lora_vs, adapter_unet) = adapted_unet(&base_vs, None);
        let half = Tensor::cat(&[mask(1.).narrow(3, 0, 4), mask(0.).narrow(3, 0, 4)], 3);
        pnp.add_adapter(StyleAdapter::new(adapter_unet, half, fixture.text_embeddings.shallow_clone()));
        pnp.register_injection(2, 1);
        pnp
    };
    let first = run(&build());
    let second = run(&build());
    assert_eq!(first.size(), [1, 4, 8, 8]);
    assert!(first.equal(&second));
}

#[test]
fn injection_is_shared_by_every_network() {
    let fixture = Fixture::new(&[501, 1]);
    let (base_vs, _) = tiny_unet(0);
    let mut pnp = fixture.pipeline(copy_unet(&base_vs), 7.5);
    let (_a, first) = adapted_unet(&base_vs, None);
    pnp.add_adapter(StyleAdapter::new(first, mask(0.), embeddings(2)));
    let schedule = pnp.register_injection(1, -1);
    // Registered after the schedule exists.
    let (_b, second) = adapted_unet(&base_vs, None);
    pnp.add_adapter(StyleAdapter::new(second, mask(0.), embeddings(2)));

    assert_eq!(schedule.conv_timesteps(), [501]);
    assert!(schedule.qk_timesteps().is_empty());
    for adapter in pnp.adapters() {
        let registered = adapter.unet.injection_schedule().unwrap();
        assert!(Arc::ptr_eq(registered, &schedule));
        // up_blocks[1] holds the conv target and two of the attention targets.
        assert_eq!(adapter.unet.injection_targets(), (1, 2));
    }
}

#[test]
fn injection_changes_the_generation() {
    let fixture = Fixture::new(&[501, 1]);
    let (base_vs, _) = tiny_unet(0);
    let mut injected = fixture.pipeline(copy_unet(&base_vs), 7.5);
    injected.register_injection(2, 2);
    let mut free = fixture.pipeline(copy_unet(&base_vs), 7.5);
    free.register_injection(-1, -1);
    let unregistered = fixture.pipeline(copy_unet(&base_vs), 7.5);

    let free = run(&free);
    assert!(!run(&injected).equal(&free));
    assert!(run(&unregistered).equal(&free));
}
