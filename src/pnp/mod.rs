//! # Plug-and-play editing
//!
//! The editing workflow replays the cached diffusion trajectory of a source image next to
//! the new generation. Decoder features and self-attention queries/keys of the source pass
//! are injected into the generation at the early timesteps, and LoRA adapted copies of
//! the UNet paint their style inside spatial masks.
pub mod adapters;
pub mod edit;
pub mod embeddings;
pub mod injection;
pub mod latents;
pub mod sampler;

pub use adapters::StyleAdapter;
pub use injection::{injection_steps, Injection, InjectionSchedule};
pub use latents::SourceLatentStore;
pub use sampler::PlugAndPlay;
