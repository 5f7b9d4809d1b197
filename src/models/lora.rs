//! Low-rank adapters for the UNet attention projections.
//!
//! The adapter weights live in their own `VarStore` so that they can be trained while the
//! base UNet stays frozen, and saved or loaded independently of it. Variable names follow
//! the diffusers attention processor layout, e.g.
//! `up_blocks.1.attentions.0.transformer_blocks.0.attn1.processor.to_q_lora.down.weight`.
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use tch::{nn, nn::Module, Tensor};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoraConfig {
    pub rank: i64,
    /// Multiplier applied to the adapter branch.
    pub scale: f64,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self { rank: 16, scale: 1.0 }
    }
}

/// `scale * up(down(xs))`, added to the output of a frozen linear layer.
#[derive(Debug)]
pub struct LoraLinear {
    down: nn::Linear,
    up: nn::Linear,
    scale: f64,
}

impl LoraLinear {
    pub fn new(vs: nn::Path, in_dim: i64, out_dim: i64, config: LoraConfig) -> Self {
        let down_cfg = nn::LinearConfig {
            ws_init: nn::Init::Randn { mean: 0., stdev: 1. / config.rank as f64 },
            bs_init: None,
            bias: false,
        };
        // The up projection starts at zero so that a fresh adapter leaves the UNet unchanged.
        let up_cfg = nn::LinearConfig { ws_init: nn::Init::Const(0.), bs_init: None, bias: false };
        let down = nn::linear(&vs / "down", in_dim, config.rank, down_cfg);
        let up = nn::linear(&vs / "up", config.rank, out_dim, up_cfg);
        Self { down, up, scale: config.scale }
    }
}

impl Module for LoraLinear {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.down).apply(&self.up) * self.scale
    }
}

/// Applies a frozen linear layer and, when present, its adapter.
pub(crate) fn apply_with_lora(xs: &Tensor, base: &nn::Linear, lora: &Option<LoraLinear>) -> Tensor {
    match lora {
        None => xs.apply(base),
        Some(lora) => xs.apply(base) + xs.apply(lora),
    }
}

/// A path in the adapter `VarStore` that mirrors the UNet path being built, or nothing
/// when the UNet is built without adapters.
#[derive(Debug, Clone)]
pub struct LoraPath<'a> {
    inner: Option<(nn::Path<'a>, LoraConfig)>,
}

impl<'a> LoraPath<'a> {
    pub fn new(vs: nn::Path<'a>, config: LoraConfig) -> Self {
        Self { inner: Some((vs, config)) }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn is_some(&self) -> bool {
        self.inner.is_some()
    }

    pub fn sub<T: std::string::ToString>(&self, name: T) -> Self {
        let inner = self.inner.as_ref().map(|(vs, config)| (vs / name, *config));
        Self { inner }
    }

    /// Creates the adapter for a linear layer at the current path, if adapters are enabled.
    pub fn linear(&self, in_dim: i64, out_dim: i64) -> Option<LoraLinear> {
        self.inner.as_ref().map(|(vs, config)| LoraLinear::new(vs.clone(), in_dim, out_dim, *config))
    }
}

impl<'a, T: std::string::ToString> std::ops::Div<T> for &LoraPath<'a> {
    type Output = LoraPath<'a>;

    fn div(self, rhs: T) -> LoraPath<'a> {
        self.sub(rhs)
    }
}

impl<'a, T: std::string::ToString> std::ops::Div<T> for LoraPath<'a> {
    type Output = LoraPath<'a>;

    fn div(self, rhs: T) -> LoraPath<'a> {
        self.sub(rhs)
    }
}

/// Reads adapter weights saved either as safetensors or in the libtorch format.
pub fn read_weights<P: AsRef<Path>>(path: P) -> anyhow::Result<HashMap<String, Tensor>> {
    let path = crate::utils::require_file("adapter weights", path)?;
    let tensors = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => Tensor::read_safetensors(&path)?,
        _ => Tensor::load_multi(&path)?,
    };
    Ok(tensors.into_iter().collect())
}

/// Moves every adapter variable of `target` towards `other`: `(1 - alpha) * w + alpha * o`.
/// Both must hold the same set of variables.
pub fn interpolate(target: &nn::VarStore, other: &HashMap<String, Tensor>, alpha: f64) -> anyhow::Result<()> {
    let target_vars = target.variables();
    let names: BTreeSet<&String> = target_vars.keys().collect();
    let other_names: BTreeSet<&String> = other.keys().collect();
    if names != other_names {
        anyhow::bail!("cannot interpolate adapters with different variable sets")
    }
    tch::no_grad(|| {
        for (name, var) in target_vars.iter() {
            let other = other[name].to_device(var.device()).to_kind(var.kind());
            let blended = var * (1. - alpha) + other * alpha;
            let mut var = var.shallow_clone();
            var.copy_(&blended);
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn fresh_adapter_is_a_no_op() {
        let vs = nn::VarStore::new(Device::Cpu);
        let lora = LoraLinear::new(vs.root() / "to_q_lora", 8, 4, LoraConfig { rank: 2, scale: 1. });
        let xs = Tensor::randn([3, 8], (Kind::Float, Device::Cpu));
        let ys = xs.apply(&lora);
        assert_eq!(ys.size(), [3, 4]);
        assert_eq!(ys.abs().sum(Kind::Float).double_value(&[]), 0.);
    }

    #[test]
    fn disabled_path_creates_nothing() {
        let path = LoraPath::none();
        assert!(!path.is_some());
        assert!((&path / "processor" / "to_q_lora").linear(8, 8).is_none());
    }

    #[test]
    fn variable_names_follow_processor_layout() {
        let vs = nn::VarStore::new(Device::Cpu);
        let path = LoraPath::new(vs.root(), LoraConfig::default());
        let _lora = (&path / "attn1" / "processor" / "to_q_lora").linear(8, 8);
        let mut names: Vec<String> = vs.variables().into_keys().collect();
        names.sort();
        assert_eq!(
            names,
            ["attn1.processor.to_q_lora.down.weight", "attn1.processor.to_q_lora.up.weight"]
        );
    }

    #[test]
    fn interpolation_blends_every_variable() {
        let target = nn::VarStore::new(Device::Cpu);
        let _ = target.root().var("w", &[2, 2], nn::Init::Const(1.));
        let other: HashMap<String, Tensor> =
            [("w".to_string(), Tensor::ones([2, 2], (Kind::Float, Device::Cpu)) * 3.)].into();
        interpolate(&target, &other, 0.25).unwrap();
        let w = &target.variables()["w"];
        assert!((w.mean(Kind::Float).double_value(&[]) - 1.5).abs() < 1e-6);

        let mismatched: HashMap<String, Tensor> =
            [("v".to_string(), Tensor::zeros([2, 2], (Kind::Float, Device::Cpu)))].into();
        assert!(interpolate(&target, &mismatched, 0.5).is_err());
    }

    #[test]
    fn saved_adapters_read_back_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let vs = nn::VarStore::new(Device::Cpu);
        let path = LoraPath::new(vs.root(), LoraConfig { rank: 2, scale: 1. });
        let _lora = (&path / "to_k_lora").linear(4, 4);
        let file = dir.path().join("lora.safetensors");
        vs.save(&file).unwrap();
        let weights = read_weights(&file).unwrap();
        assert!(weights.contains_key("to_k_lora.down.weight"));
        assert_eq!(weights["to_k_lora.up.weight"].size(), [4, 2]);
    }
}
