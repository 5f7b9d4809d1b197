//! Learning rate schedules, following the diffusers `get_scheduler` names.

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LrSchedule {
    #[default]
    Constant,
    ConstantWithWarmup {
        warmup_steps: usize,
    },
    /// Linear warmup followed by a linear decay to zero at the last step.
    Linear {
        warmup_steps: usize,
    },
}

impl LrSchedule {
    /// The learning rate used for the optimizer step `step` (zero based) out of
    /// `total_steps`.
    pub fn lr(&self, base_lr: f64, step: usize, total_steps: usize) -> f64 {
        let warmup = |warmup_steps: usize| {
            if step < warmup_steps {
                Some(base_lr * step as f64 / warmup_steps as f64)
            } else {
                None
            }
        };
        match *self {
            Self::Constant => base_lr,
            Self::ConstantWithWarmup { warmup_steps } => warmup(warmup_steps).unwrap_or(base_lr),
            Self::Linear { warmup_steps } => warmup(warmup_steps).unwrap_or_else(|| {
                let remaining = total_steps.saturating_sub(step) as f64;
                let decay_steps = total_steps.saturating_sub(warmup_steps).max(1) as f64;
                base_lr * (remaining / decay_steps).max(0.)
            }),
        }
    }
}

impl std::str::FromStr for LrSchedule {
    type Err = anyhow::Error;

    /// `constant`, `constant_with_warmup:<steps>` or `linear[:<warmup steps>]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, steps) = match s.split_once(':') {
            Some((name, steps)) => (name, Some(steps.parse::<usize>()?)),
            None => (s, None),
        };
        match (name, steps) {
            ("constant", None) => Ok(Self::Constant),
            ("constant_with_warmup", Some(warmup_steps)) => Ok(Self::ConstantWithWarmup { warmup_steps }),
            ("linear", warmup_steps) => Ok(Self::Linear { warmup_steps: warmup_steps.unwrap_or(0) }),
            _ => anyhow::bail!("unknown learning rate schedule {s}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_is_flat() {
        for step in 0..200 {
            assert_eq!(LrSchedule::Constant.lr(2e-4, step, 200), 2e-4);
        }
    }

    #[test]
    fn warmup_then_decay() {
        let warmup = LrSchedule::ConstantWithWarmup { warmup_steps: 10 };
        assert_eq!(warmup.lr(1.0, 0, 100), 0.);
        assert_eq!(warmup.lr(1.0, 5, 100), 0.5);
        assert_eq!(warmup.lr(1.0, 50, 100), 1.0);

        let linear = LrSchedule::Linear { warmup_steps: 0 };
        assert_eq!(linear.lr(1.0, 0, 100), 1.0);
        assert_eq!(linear.lr(1.0, 50, 100), 0.5);
        assert_eq!(linear.lr(1.0, 100, 100), 0.);
    }

    #[test]
    fn parse_names() {
        assert_eq!("constant".parse::<LrSchedule>().unwrap(), LrSchedule::Constant);
        assert_eq!(
            "constant_with_warmup:20".parse::<LrSchedule>().unwrap(),
            LrSchedule::ConstantWithWarmup { warmup_steps: 20 }
        );
        assert_eq!("linear".parse::<LrSchedule>().unwrap(), LrSchedule::Linear { warmup_steps: 0 });
        assert!("cosine".parse::<LrSchedule>().is_err());
    }
}
