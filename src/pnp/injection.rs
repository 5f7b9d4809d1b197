//! Timestep gating for plug-and-play feature injection.
//!
//! The denoising batch is laid out as `[source | uncond | cond]`. At the timesteps selected
//! here, the flagged UNet layers overwrite the `uncond` and `cond` thirds of their
//! activations with the `source` third, so that the structure of the generation follows
//! the source image while the prompt drives its content.
use tch::Tensor;

/// What the injection target layers do during a single forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Injection {
    /// Replace the residual branch of the flagged resnet.
    pub conv: bool,
    /// Replace the self-attention queries and keys of the flagged transformer blocks.
    pub qk: bool,
}

impl Injection {
    pub fn none() -> Self {
        Self::default()
    }
}

/// The feature and attention injection timesteps, both prefixes of the scheduler's
/// (descending) timestep schedule, so the noisiest steps are injected first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InjectionSchedule {
    conv_timesteps: Vec<usize>,
    qk_timesteps: Vec<usize>,
}

fn prefix(timesteps: &[usize], n_steps: i64) -> Vec<usize> {
    if n_steps < 0 {
        return vec![];
    }
    let n_steps = usize::min(n_steps as usize, timesteps.len());
    timesteps[..n_steps].to_vec()
}

impl InjectionSchedule {
    /// A negative step count disables the corresponding injection.
    pub fn new(timesteps: &[usize], conv_steps: i64, qk_steps: i64) -> Self {
        Self { conv_timesteps: prefix(timesteps, conv_steps), qk_timesteps: prefix(timesteps, qk_steps) }
    }

    pub fn conv_timesteps(&self) -> &[usize] {
        &self.conv_timesteps
    }

    pub fn qk_timesteps(&self) -> &[usize] {
        &self.qk_timesteps
    }

    pub fn at(&self, timestep: usize) -> Injection {
        Injection {
            conv: self.conv_timesteps.contains(&timestep),
            qk: self.qk_timesteps.contains(&timestep),
        }
    }
}

/// Number of injected steps for a fraction of the schedule, truncated towards zero.
pub fn injection_steps(n_timesteps: usize, fraction: f64) -> i64 {
    (n_timesteps as f64 * fraction) as i64
}

/// Copies the first third of the batch over the two other thirds. Batches that are not
/// laid out in thirds are returned unchanged.
pub(crate) fn replicate_source(xs: &Tensor) -> Tensor {
    let batch = xs.size()[0];
    if batch == 0 || batch % 3 != 0 {
        return xs.shallow_clone();
    }
    let source = xs.narrow(0, 0, batch / 3);
    Tensor::cat(&[&source, &source, &source], 0)
}
