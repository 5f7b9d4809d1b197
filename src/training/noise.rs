//! The forward diffusion process used as the training target.
use crate::Error;
use diffusers::schedulers::{ddim::DDIMSchedulerConfig, BetaSchedule, PredictionType};
use tch::{Kind, Tensor};

/// Cumulative noise levels of the training schedule.
#[derive(Debug, Clone)]
pub struct NoiseSchedule {
    alphas_cumprod: Vec<f64>,
    prediction_type: PredictionType,
}

fn cosine_betas(train_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    (0..train_timesteps)
        .map(|i| {
            let t1 = i as f64 / train_timesteps as f64;
            let t2 = (i + 1) as f64 / train_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

impl NoiseSchedule {
    pub fn new(
        train_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        beta_schedule: BetaSchedule,
        prediction_type: PredictionType,
    ) -> Self {
        let betas: Vec<f64> = match beta_schedule {
            BetaSchedule::ScaledLinear => linspace(beta_start.sqrt(), beta_end.sqrt(), train_timesteps)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            BetaSchedule::Linear => linspace(beta_start, beta_end, train_timesteps),
            BetaSchedule::SquaredcosCapV2 => cosine_betas(train_timesteps, 0.999),
        };
        let mut alphas_cumprod = Vec::with_capacity(train_timesteps);
        let mut acc = 1.0;
        for beta in betas {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc)
        }
        Self { alphas_cumprod, prediction_type }
    }

    /// The training schedule matching a sampling scheduler configuration.
    pub fn from_ddim(config: &DDIMSchedulerConfig) -> Self {
        Self::new(
            config.train_timesteps,
            config.beta_start,
            config.beta_end,
            config.beta_schedule,
            config.prediction_type,
        )
    }

    pub fn with_prediction_type(mut self, prediction_type: PredictionType) -> Self {
        self.prediction_type = prediction_type;
        self
    }

    pub fn train_timesteps(&self) -> usize {
        self.alphas_cumprod.len()
    }

    pub fn prediction_type(&self) -> PredictionType {
        self.prediction_type
    }

    fn coefficients(&self, timestep: usize) -> (f64, f64) {
        let alpha_prod = self.alphas_cumprod[timestep];
        (alpha_prod.sqrt(), (1. - alpha_prod).sqrt())
    }

    /// `sqrt(a) * original + sqrt(1 - a) * noise`, `a` being the cumulative alpha at
    /// `timestep`.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Tensor {
        let (sqrt_alpha_prod, sqrt_one_minus_alpha_prod) = self.coefficients(timestep);
        original * sqrt_alpha_prod + noise * sqrt_one_minus_alpha_prod
    }

    pub fn velocity(&self, sample: &Tensor, noise: &Tensor, timestep: usize) -> Tensor {
        let (sqrt_alpha_prod, sqrt_one_minus_alpha_prod) = self.coefficients(timestep);
        noise * sqrt_alpha_prod - sample * sqrt_one_minus_alpha_prod
    }

    /// What the network learns to predict for the configured prediction type.
    pub fn target(&self, sample: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor, Error> {
        match self.prediction_type {
            PredictionType::Epsilon => Ok(noise.shallow_clone()),
            PredictionType::VPrediction => Ok(self.velocity(sample, noise, timestep)),
            PredictionType::Sample => Err(Error::UnsupportedPredictionType("sample".to_string())),
        }
    }

    /// Draws a training timestep uniformly, using the torch generator so that runs are
    /// reproducible under `tch::manual_seed`.
    pub fn sample_timestep(&self, device: tch::Device) -> usize {
        let t = Tensor::randint(self.train_timesteps() as i64, [1], (Kind::Int64, device));
        t.int64_value(&[0]) as usize
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        n => (0..n).map(|i| start + (end - start) * i as f64 / (n - 1) as f64).collect(),
    }
}

/// Parses the prediction type names used on the command line.
pub fn parse_prediction_type(name: &str) -> Result<PredictionType, Error> {
    match name {
        "epsilon" => Ok(PredictionType::Epsilon),
        "v_prediction" => Ok(PredictionType::VPrediction),
        other => Err(Error::UnsupportedPredictionType(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::Device;

    fn sd_schedule(prediction_type: PredictionType) -> NoiseSchedule {
        NoiseSchedule::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear, prediction_type)
    }

    #[test]
    fn noise_levels_decrease() {
        let schedule = sd_schedule(PredictionType::Epsilon);
        assert_eq!(schedule.train_timesteps(), 1000);
        assert!((schedule.alphas_cumprod[0] - (1. - 0.00085)).abs() < 1e-9);
        assert!(schedule.alphas_cumprod.windows(2).all(|w| w[1] < w[0]));
        let cosine = NoiseSchedule::new(1000, 0., 0., BetaSchedule::SquaredcosCapV2, PredictionType::Epsilon);
        assert!(cosine.alphas_cumprod.windows(2).all(|w| w[1] < w[0]));
    }

    #[test]
    fn targets_follow_prediction_type() {
        let opts = (Kind::Float, Device::Cpu);
        let sample = Tensor::randn([1, 4, 8, 8], opts);
        let noise = Tensor::randn([1, 4, 8, 8], opts);
        let epsilon = sd_schedule(PredictionType::Epsilon);
        assert!(epsilon.target(&sample, &noise, 10).unwrap().equal(&noise));

        let v = sd_schedule(PredictionType::VPrediction);
        let (a, b) = v.coefficients(500);
        let expected = &noise * a - &sample * b;
        assert!(v.target(&sample, &noise, 500).unwrap().allclose(&expected, 1e-5, 1e-6, false));

        let err = sd_schedule(PredictionType::Sample).target(&sample, &noise, 0).unwrap_err();
        assert!(matches!(err, Error::UnsupportedPredictionType(_)));
    }

    #[test]
    fn prediction_type_names() {
        assert!(matches!(parse_prediction_type("epsilon"), Ok(PredictionType::Epsilon)));
        assert!(matches!(parse_prediction_type("v_prediction"), Ok(PredictionType::VPrediction)));
        assert!(parse_prediction_type("flow").is_err());
    }

    #[test]
    fn timesteps_are_in_range() {
        let schedule = sd_schedule(PredictionType::Epsilon);
        for _ in 0..32 {
            assert!(schedule.sample_timestep(Device::Cpu) < 1000);
        }
    }
}
