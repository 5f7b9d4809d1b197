use std::path::PathBuf;

/// The fatal failures of a run. None of these are retried, the run has to be restarted
/// once the underlying configuration or artifact has been fixed.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("stable-diffusion version {0} not supported")]
    UnsupportedModelVersion(String),

    #[error("unknown prediction type {0}")]
    UnsupportedPredictionType(String),

    #[error("unknown device {0}, expected one of cpu, cuda, cuda:<n>, mps")]
    UnknownDevice(String),

    #[error("no source latent for timestep {timestep}, expected {path:?}")]
    MissingSourceLatent { timestep: usize, path: PathBuf },

    #[error("n_timesteps must be between 1 and {train_timesteps}, got {n_timesteps}")]
    InvalidTimestepCount { n_timesteps: usize, train_timesteps: usize },

    #[error("missing {kind} file {path:?}")]
    MissingArtifact { kind: &'static str, path: PathBuf },
}
