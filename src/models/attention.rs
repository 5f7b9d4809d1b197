//! Attention Based Building Blocks
//!
//! The transformer blocks of the denoising UNet. Every attention projection can carry a
//! low-rank adapter, and the self-attention can take its queries and keys from the source
//! third of the batch when plug-and-play injection is active.
use crate::models::lora::{apply_with_lora, LoraLinear, LoraPath};
use crate::pnp::injection::{replicate_source, Injection};
use tch::{nn, nn::Module, IndexOp, Kind, Tensor};

#[derive(Debug)]
struct GeGlu {
    proj: nn::Linear,
}

impl GeGlu {
    fn new(vs: nn::Path, dim_in: i64, dim_out: i64) -> Self {
        let proj = nn::linear(&vs / "proj", dim_in, dim_out * 2, Default::default());
        Self { proj }
    }
}

impl Module for GeGlu {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let hidden_states_and_gate = xs.apply(&self.proj).chunk(2, -1);
        &hidden_states_and_gate[0] * hidden_states_and_gate[1].gelu("none")
    }
}

#[derive(Debug)]
struct FeedForward {
    project_in: GeGlu,
    linear: nn::Linear,
}

impl FeedForward {
    fn new(vs: nn::Path, dim: i64, mult: i64) -> Self {
        let inner_dim = dim * mult;
        let vs = &vs / "net";
        let project_in = GeGlu::new(&vs / 0, dim, inner_dim);
        let linear = nn::linear(&vs / 2, inner_dim, dim, Default::default());
        Self { project_in, linear }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.project_in).apply(&self.linear)
    }
}

#[derive(Debug)]
struct AttentionLora {
    to_q: Option<LoraLinear>,
    to_k: Option<LoraLinear>,
    to_v: Option<LoraLinear>,
    to_out: Option<LoraLinear>,
}

#[derive(Debug)]
struct CrossAttention {
    to_q: nn::Linear,
    to_k: nn::Linear,
    to_v: nn::Linear,
    to_out: nn::Linear,
    lora: AttentionLora,
    heads: i64,
    scale: f64,
    slice_size: Option<i64>,
    qk_injection: bool,
}

impl CrossAttention {
    fn new(
        vs: nn::Path,
        lora: LoraPath,
        query_dim: i64,
        context_dim: Option<i64>,
        heads: i64,
        dim_head: i64,
        slice_size: Option<i64>,
    ) -> Self {
        let no_bias = nn::LinearConfig { bias: false, ..Default::default() };
        let inner_dim = dim_head * heads;
        let context_dim = context_dim.unwrap_or(query_dim);
        let scale = 1.0 / f64::sqrt(dim_head as f64);
        let to_q = nn::linear(&vs / "to_q", query_dim, inner_dim, no_bias);
        let to_k = nn::linear(&vs / "to_k", context_dim, inner_dim, no_bias);
        let to_v = nn::linear(&vs / "to_v", context_dim, inner_dim, no_bias);
        let to_out = nn::linear(&vs / "to_out" / 0, inner_dim, query_dim, Default::default());
        let lora = &lora / "processor";
        let lora = AttentionLora {
            to_q: (&lora / "to_q_lora").linear(query_dim, inner_dim),
            to_k: (&lora / "to_k_lora").linear(context_dim, inner_dim),
            to_v: (&lora / "to_v_lora").linear(context_dim, inner_dim),
            to_out: (&lora / "to_out_lora").linear(inner_dim, query_dim),
        };
        Self { to_q, to_k, to_v, to_out, lora, heads, scale, slice_size, qk_injection: false }
    }

    fn reshape_heads_to_batch_dim(&self, xs: &Tensor) -> Tensor {
        let (batch_size, seq_len, dim) = xs.size3().unwrap();
        xs.reshape([batch_size, seq_len, self.heads, dim / self.heads])
            .permute([0, 2, 1, 3])
            .reshape([batch_size * self.heads, seq_len, dim / self.heads])
    }

    fn reshape_batch_dim_to_heads(&self, xs: &Tensor) -> Tensor {
        let (batch_size, seq_len, dim) = xs.size3().unwrap();
        xs.reshape([batch_size / self.heads, self.heads, seq_len, dim])
            .permute([0, 2, 1, 3])
            .reshape([batch_size / self.heads, seq_len, dim * self.heads])
    }

    fn attention(&self, query: &Tensor, key: &Tensor, value: &Tensor) -> Tensor {
        query
            .matmul(&(key.transpose(-1, -2) * self.scale))
            .softmax(-1, Kind::Float)
            .matmul(value)
    }

    fn sliced_attention(&self, query: &Tensor, key: &Tensor, value: &Tensor, slice_size: i64) -> Tensor {
        let batch_size_attention = query.size()[0];
        let slices: Vec<Tensor> = (0..batch_size_attention)
            .step_by(slice_size as usize)
            .map(|start_idx| {
                let end_idx = i64::min(start_idx + slice_size, batch_size_attention);
                self.attention(
                    &query.i(start_idx..end_idx),
                    &key.i(start_idx..end_idx),
                    &value.i(start_idx..end_idx),
                )
            })
            .collect();
        Tensor::cat(&slices, 0)
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>, injection: Injection) -> Tensor {
        let is_self_attention = context.is_none();
        let context = context.unwrap_or(xs);
        let query = apply_with_lora(xs, &self.to_q, &self.lora.to_q);
        let key = apply_with_lora(context, &self.to_k, &self.lora.to_k);
        let value = apply_with_lora(context, &self.to_v, &self.lora.to_v);
        let (query, key) = if self.qk_injection && injection.qk && is_self_attention {
            (replicate_source(&query), replicate_source(&key))
        } else {
            (query, key)
        };
        let query = self.reshape_heads_to_batch_dim(&query);
        let key = self.reshape_heads_to_batch_dim(&key);
        let value = self.reshape_heads_to_batch_dim(&value);
        let xs = match self.slice_size {
            Some(slice_size) if query.size()[0] / slice_size > 1 => {
                self.sliced_attention(&query, &key, &value, slice_size)
            }
            _ => self.attention(&query, &key, &value),
        };
        let xs = self.reshape_batch_dim_to_heads(&xs);
        apply_with_lora(&xs, &self.to_out, &self.lora.to_out)
    }
}

/// A basic Transformer block.
#[derive(Debug)]
struct BasicTransformerBlock {
    attn1: CrossAttention,
    ff: FeedForward,
    attn2: CrossAttention,
    norm1: nn::LayerNorm,
    norm2: nn::LayerNorm,
    norm3: nn::LayerNorm,
}

impl BasicTransformerBlock {
    fn new(
        vs: nn::Path,
        lora: LoraPath,
        dim: i64,
        n_heads: i64,
        d_head: i64,
        context_dim: Option<i64>,
        sliced_attention_size: Option<i64>,
    ) -> Self {
        let attn1 = CrossAttention::new(
            &vs / "attn1",
            &lora / "attn1",
            dim,
            None,
            n_heads,
            d_head,
            sliced_attention_size,
        );
        let ff = FeedForward::new(&vs / "ff", dim, 4);
        let attn2 = CrossAttention::new(
            &vs / "attn2",
            &lora / "attn2",
            dim,
            context_dim,
            n_heads,
            d_head,
            sliced_attention_size,
        );
        let norm1 = nn::layer_norm(&vs / "norm1", vec![dim], Default::default());
        let norm2 = nn::layer_norm(&vs / "norm2", vec![dim], Default::default());
        let norm3 = nn::layer_norm(&vs / "norm3", vec![dim], Default::default());
        Self { attn1, ff, attn2, norm1, norm2, norm3 }
    }

    fn forward(&self, xs: &Tensor, context: Option<&Tensor>, injection: Injection) -> Tensor {
        let xs = self.attn1.forward(&xs.apply(&self.norm1), None, injection) + xs;
        let xs = self.attn2.forward(&xs.apply(&self.norm2), context, injection) + xs;
        xs.apply(&self.norm3).apply(&self.ff) + xs
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SpatialTransformerConfig {
    pub depth: i64,
    pub num_groups: i64,
    pub context_dim: Option<i64>,
    pub sliced_attention_size: Option<i64>,
    pub use_linear_projection: bool,
}

impl Default for SpatialTransformerConfig {
    fn default() -> Self {
        Self {
            depth: 1,
            num_groups: 32,
            context_dim: None,
            sliced_attention_size: None,
            use_linear_projection: false,
        }
    }
}

#[derive(Debug)]
enum Proj {
    Conv2D(nn::Conv2D),
    Linear(nn::Linear),
}

// Aka Transformer2DModel
#[derive(Debug)]
pub struct SpatialTransformer {
    norm: nn::GroupNorm,
    proj_in: Proj,
    transformer_blocks: Vec<BasicTransformerBlock>,
    proj_out: Proj,
    pub config: SpatialTransformerConfig,
}

impl SpatialTransformer {
    pub fn new(
        vs: nn::Path,
        lora: LoraPath,
        in_channels: i64,
        n_heads: i64,
        d_head: i64,
        config: SpatialTransformerConfig,
    ) -> Self {
        let inner_dim = n_heads * d_head;
        let group_cfg = nn::GroupNormConfig { eps: 1e-6, affine: true, ..Default::default() };
        let norm = nn::group_norm(&vs / "norm", config.num_groups, in_channels, group_cfg);
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 0, ..Default::default() };
        let proj_in = if config.use_linear_projection {
            Proj::Linear(nn::linear(&vs / "proj_in", in_channels, inner_dim, Default::default()))
        } else {
            Proj::Conv2D(nn::conv2d(&vs / "proj_in", in_channels, inner_dim, 1, conv_cfg))
        };
        let vs_tb = &vs / "transformer_blocks";
        let lora_tb = &lora / "transformer_blocks";
        let transformer_blocks = (0..config.depth)
            .map(|index| {
                BasicTransformerBlock::new(
                    &vs_tb / index,
                    &lora_tb / index,
                    inner_dim,
                    n_heads,
                    d_head,
                    config.context_dim,
                    config.sliced_attention_size,
                )
            })
            .collect();
        let proj_out = if config.use_linear_projection {
            Proj::Linear(nn::linear(&vs / "proj_out", inner_dim, in_channels, Default::default()))
        } else {
            Proj::Conv2D(nn::conv2d(&vs / "proj_out", inner_dim, in_channels, 1, conv_cfg))
        };
        Self { norm, proj_in, transformer_blocks, proj_out, config }
    }

    /// Lets the self-attention of every transformer block take its queries and keys from
    /// the source third of the batch when an injection asks for it.
    pub(crate) fn enable_qk_injection(&mut self) {
        for block in self.transformer_blocks.iter_mut() {
            block.attn1.qk_injection = true
        }
    }

    pub(crate) fn has_qk_injection(&self) -> bool {
        self.transformer_blocks.iter().any(|block| block.attn1.qk_injection)
    }

    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>, injection: Injection) -> Tensor {
        let (batch, _channel, height, weight) = xs.size4().unwrap();
        let residual = xs;
        let xs = xs.apply(&self.norm);
        let (inner_dim, xs) = match &self.proj_in {
            Proj::Conv2D(p) => {
                let xs = xs.apply(p);
                let inner_dim = xs.size()[1];
                let xs = xs.permute([0, 2, 3, 1]).reshape([batch, height * weight, inner_dim]);
                (inner_dim, xs)
            }
            Proj::Linear(p) => {
                let channels = xs.size()[1];
                let xs = xs.permute([0, 2, 3, 1]).reshape([batch, height * weight, channels]);
                let xs = xs.apply(p);
                (xs.size()[2], xs)
            }
        };
        let mut xs = xs;
        for block in self.transformer_blocks.iter() {
            xs = block.forward(&xs, context, injection)
        }
        let xs = match &self.proj_out {
            Proj::Conv2D(p) => {
                xs.reshape([batch, height, weight, inner_dim]).permute([0, 3, 1, 2]).apply(p)
            }
            Proj::Linear(p) => {
                let xs = xs.apply(p);
                let channels = xs.size()[2];
                xs.reshape([batch, height, weight, channels]).permute([0, 3, 1, 2])
            }
        };
        xs + residual
    }
}
