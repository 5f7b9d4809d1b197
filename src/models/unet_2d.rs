//! 2D UNet Denoising Models
//!
//! The 2D Unet models take as input a noisy sample and the current diffusion
//! timestep and return a denoised version of the input.
//!
//! Compared to the plain diffusers UNet, this one can carry low-rank adapters on all its
//! attention projections and can be registered for plug-and-play injection, in which case
//! a fixed set of decoder layers reads source-image features at scheduled timesteps.
use crate::models::lora::LoraPath;
use crate::models::unet_2d_blocks::*;
use crate::pnp::injection::{Injection, InjectionSchedule};
use diffusers::models::embeddings::{TimestepEmbedding, Timesteps};
use std::sync::Arc;
use tch::{nn, Kind, Tensor};

/// Decoder resnet whose residual branch is replaced by the source features, as
/// `(up block, resnet)`.
pub const CONV_INJECTION_LAYER: (usize, usize) = (1, 1);

/// Decoder transformers whose self-attention queries and keys are replaced by the source
/// ones, as `(up block, attention)`.
pub const QK_INJECTION_LAYERS: [(usize, usize); 8] =
    [(1, 1), (1, 2), (2, 0), (2, 1), (2, 2), (3, 0), (3, 1), (3, 2)];

#[derive(Debug, Clone, Copy)]
pub struct BlockConfig {
    pub out_channels: i64,
    pub use_cross_attn: bool,
    pub attention_head_dim: i64,
}

#[derive(Debug, Clone)]
pub struct UNet2DConditionModelConfig {
    pub center_input_sample: bool,
    pub flip_sin_to_cos: bool,
    pub freq_shift: f64,
    pub blocks: Vec<BlockConfig>,
    pub layers_per_block: i64,
    pub downsample_padding: i64,
    pub mid_block_scale_factor: f64,
    pub norm_num_groups: i64,
    pub norm_eps: f64,
    pub cross_attention_dim: i64,
    pub sliced_attention_size: Option<i64>,
    pub use_linear_projection: bool,
}

impl Default for UNet2DConditionModelConfig {
    fn default() -> Self {
        Self {
            center_input_sample: false,
            flip_sin_to_cos: true,
            freq_shift: 0.,
            blocks: vec![
                BlockConfig { out_channels: 320, use_cross_attn: true, attention_head_dim: 8 },
                BlockConfig { out_channels: 640, use_cross_attn: true, attention_head_dim: 8 },
                BlockConfig { out_channels: 1280, use_cross_attn: true, attention_head_dim: 8 },
                BlockConfig { out_channels: 1280, use_cross_attn: false, attention_head_dim: 8 },
            ],
            layers_per_block: 2,
            downsample_padding: 1,
            mid_block_scale_factor: 1.,
            norm_num_groups: 32,
            norm_eps: 1e-5,
            cross_attention_dim: 1280,
            sliced_attention_size: None,
            use_linear_projection: false,
        }
    }
}

#[derive(Debug)]
enum UNetDownBlock {
    Basic(DownBlock2D),
    CrossAttn(CrossAttnDownBlock2D),
}

#[derive(Debug)]
enum UNetUpBlock {
    Basic(UpBlock2D),
    CrossAttn(CrossAttnUpBlock2D),
}

impl UNetUpBlock {
    fn upblock_mut(&mut self) -> &mut UpBlock2D {
        match self {
            UNetUpBlock::Basic(b) => b,
            UNetUpBlock::CrossAttn(b) => &mut b.upblock,
        }
    }

    fn upblock(&self) -> &UpBlock2D {
        match self {
            UNetUpBlock::Basic(b) => b,
            UNetUpBlock::CrossAttn(b) => &b.upblock,
        }
    }
}

#[derive(Debug)]
pub struct UNet2DConditionModel {
    conv_in: nn::Conv2D,
    time_proj: Timesteps,
    time_embedding: TimestepEmbedding,
    down_blocks: Vec<UNetDownBlock>,
    mid_block: UNetMidBlock2DCrossAttn,
    up_blocks: Vec<UNetUpBlock>,
    conv_norm_out: nn::GroupNorm,
    conv_out: nn::Conv2D,
    injection: Option<Arc<InjectionSchedule>>,
    config: UNet2DConditionModelConfig,
}

impl UNet2DConditionModel {
    /// Builds the UNet, `lora` holds the adapter variables when it is not empty.
    pub fn new(
        vs: nn::Path,
        lora: LoraPath,
        in_channels: i64,
        out_channels: i64,
        config: UNet2DConditionModelConfig,
    ) -> Self {
        let n_blocks = config.blocks.len();
        let b_channels = config.blocks[0].out_channels;
        let bl_channels = config.blocks[n_blocks - 1].out_channels;
        let bl_attention_head_dim = config.blocks[n_blocks - 1].attention_head_dim;
        let time_embed_dim = b_channels * 4;
        let conv_cfg = nn::ConvConfig { stride: 1, padding: 1, ..Default::default() };
        let conv_in = nn::conv2d(&vs / "conv_in", in_channels, b_channels, 3, conv_cfg);

        let time_proj =
            Timesteps::new(b_channels, config.flip_sin_to_cos, config.freq_shift, vs.device());
        let time_embedding =
            TimestepEmbedding::new(&vs / "time_embedding", b_channels, time_embed_dim);

        // Enable automatic attention slicing if the config sliced_attention_size is set to 0.
        let sliced_attention_size = |attention_head_dim: i64| match config.sliced_attention_size {
            Some(0) => Some(attention_head_dim / 2),
            size => size,
        };

        let vs_db = &vs / "down_blocks";
        let lora_db = &lora / "down_blocks";
        let down_blocks = (0..n_blocks)
            .map(|i| {
                let BlockConfig { out_channels, use_cross_attn, attention_head_dim } =
                    config.blocks[i];
                let in_channels =
                    if i > 0 { config.blocks[i - 1].out_channels } else { b_channels };
                let db_cfg = DownBlock2DConfig {
                    num_layers: config.layers_per_block,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_downsample: i < n_blocks - 1,
                    downsample_padding: config.downsample_padding,
                    ..Default::default()
                };
                if use_cross_attn {
                    let cfg = CrossAttnDownBlock2DConfig {
                        downblock: db_cfg,
                        attn_num_head_channels: attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size: sliced_attention_size(attention_head_dim),
                        use_linear_projection: config.use_linear_projection,
                    };
                    let block = CrossAttnDownBlock2D::new(
                        &vs_db / i,
                        &lora_db / i,
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        cfg,
                    );
                    UNetDownBlock::CrossAttn(block)
                } else {
                    let block = DownBlock2D::new(
                        &vs_db / i,
                        in_channels,
                        out_channels,
                        Some(time_embed_dim),
                        db_cfg,
                    );
                    UNetDownBlock::Basic(block)
                }
            })
            .collect();

        let mid_cfg = UNetMidBlock2DCrossAttnConfig {
            resnet_eps: config.norm_eps,
            output_scale_factor: config.mid_block_scale_factor,
            cross_attn_dim: config.cross_attention_dim,
            attn_num_head_channels: bl_attention_head_dim,
            resnet_groups: Some(config.norm_num_groups),
            sliced_attention_size: sliced_attention_size(bl_attention_head_dim),
            use_linear_projection: config.use_linear_projection,
            ..Default::default()
        };
        let mid_block = UNetMidBlock2DCrossAttn::new(
            &vs / "mid_block",
            &lora / "mid_block",
            bl_channels,
            Some(time_embed_dim),
            mid_cfg,
        );

        let vs_ub = &vs / "up_blocks";
        let lora_ub = &lora / "up_blocks";
        let up_blocks = (0..n_blocks)
            .map(|i| {
                let BlockConfig { out_channels, use_cross_attn, attention_head_dim } =
                    config.blocks[n_blocks - 1 - i];
                let prev_out_channels =
                    if i > 0 { config.blocks[n_blocks - i].out_channels } else { bl_channels };
                let in_channels = {
                    let index = if i == n_blocks - 1 { 0 } else { n_blocks - i - 2 };
                    config.blocks[index].out_channels
                };
                let ub_cfg = UpBlock2DConfig {
                    num_layers: config.layers_per_block + 1,
                    resnet_eps: config.norm_eps,
                    resnet_groups: config.norm_num_groups,
                    add_upsample: i < n_blocks - 1,
                    ..Default::default()
                };
                if use_cross_attn {
                    let cfg = CrossAttnUpBlock2DConfig {
                        upblock: ub_cfg,
                        attn_num_head_channels: attention_head_dim,
                        cross_attention_dim: config.cross_attention_dim,
                        sliced_attention_size: sliced_attention_size(attention_head_dim),
                        use_linear_projection: config.use_linear_projection,
                    };
                    let block = CrossAttnUpBlock2D::new(
                        &vs_ub / i,
                        &lora_ub / i,
                        in_channels,
                        prev_out_channels,
                        out_channels,
                        Some(time_embed_dim),
                        cfg,
                    );
                    UNetUpBlock::CrossAttn(block)
                } else {
                    let block = UpBlock2D::new(
                        &vs_ub / i,
                        in_channels,
                        prev_out_channels,
                        out_channels,
                        Some(time_embed_dim),
                        ub_cfg,
                    );
                    UNetUpBlock::Basic(block)
                }
            })
            .collect();

        let group_cfg = nn::GroupNormConfig { eps: config.norm_eps, ..Default::default() };
        let conv_norm_out =
            nn::group_norm(&vs / "conv_norm_out", config.norm_num_groups, b_channels, group_cfg);
        let conv_out = nn::conv2d(&vs / "conv_out", b_channels, out_channels, 3, conv_cfg);
        Self {
            conv_in,
            time_proj,
            time_embedding,
            down_blocks,
            mid_block,
            up_blocks,
            conv_norm_out,
            conv_out,
            injection: None,
            config,
        }
    }

    /// Registers the plug-and-play injection policy: flags the decoder target layers and
    /// keeps a shared handle on the schedule consulted by [`Self::forward_at`]. Target
    /// layers that do not exist in this configuration are skipped.
    pub fn register_injection(&mut self, schedule: Arc<InjectionSchedule>) {
        let (block, resnet) = CONV_INJECTION_LAYER;
        if let Some(resnet) =
            self.up_blocks.get_mut(block).and_then(|b| b.upblock_mut().resnets.get_mut(resnet))
        {
            resnet.enable_conv_injection()
        }
        for (block, attention) in QK_INJECTION_LAYERS {
            if let Some(UNetUpBlock::CrossAttn(b)) = self.up_blocks.get_mut(block) {
                if let Some(attn) = b.attentions.get_mut(attention) {
                    attn.enable_qk_injection()
                }
            }
        }
        self.injection = Some(schedule)
    }

    pub fn injection_schedule(&self) -> Option<&Arc<InjectionSchedule>> {
        self.injection.as_ref()
    }

    /// The number of conv and qk injection targets flagged on this network.
    pub fn injection_targets(&self) -> (usize, usize) {
        let conv = self
            .up_blocks
            .iter()
            .flat_map(|b| b.upblock().resnets.iter())
            .filter(|r| r.has_conv_injection())
            .count();
        let qk = self
            .up_blocks
            .iter()
            .filter_map(|b| match b {
                UNetUpBlock::CrossAttn(b) => Some(b.attentions.iter()),
                UNetUpBlock::Basic(_) => None,
            })
            .flatten()
            .filter(|a| a.has_qk_injection())
            .count();
        (conv, qk)
    }

    pub fn config(&self) -> &UNet2DConditionModelConfig {
        &self.config
    }

    /// A plain denoising pass, no injection takes place.
    pub fn forward(&self, xs: &Tensor, timestep: f64, encoder_hidden_states: &Tensor) -> Tensor {
        self.forward_with_injection(xs, timestep, encoder_hidden_states, Injection::none())
    }

    /// A denoising pass at a scheduler timestep, the registered injection schedule (if
    /// any) decides which target layers read the source features.
    pub fn forward_at(&self, xs: &Tensor, timestep: usize, encoder_hidden_states: &Tensor) -> Tensor {
        let injection = match &self.injection {
            Some(schedule) => schedule.at(timestep),
            None => Injection::none(),
        };
        self.forward_with_injection(xs, timestep as f64, encoder_hidden_states, injection)
    }

    pub fn forward_with_injection(
        &self,
        xs: &Tensor,
        timestep: f64,
        encoder_hidden_states: &Tensor,
        injection: Injection,
    ) -> Tensor {
        let (bsize, _channels, height, width) = xs.size4().unwrap();
        let device = xs.device();
        let n_blocks = self.config.blocks.len();
        let num_upsamplers = n_blocks - 1;
        let default_overall_up_factor = 2i64.pow(num_upsamplers as u32);
        let forward_upsample_size =
            height % default_overall_up_factor != 0 || width % default_overall_up_factor != 0;
        // 0. center input if necessary
        let xs = if self.config.center_input_sample { xs * 2.0 - 1.0 } else { xs.shallow_clone() };
        // 1. time
        let emb = (Tensor::ones([bsize], (Kind::Float, device)) * timestep)
            .apply(&self.time_proj)
            .apply(&self.time_embedding);
        // 2. pre-process
        let xs = xs.apply(&self.conv_in);
        // 3. down
        let mut down_block_res_xs = vec![xs.shallow_clone()];
        let mut xs = xs;
        for down_block in self.down_blocks.iter() {
            let (_xs, res_xs) = match down_block {
                UNetDownBlock::Basic(b) => b.forward(&xs, Some(&emb), injection),
                UNetDownBlock::CrossAttn(b) => {
                    b.forward(&xs, Some(&emb), Some(encoder_hidden_states), injection)
                }
            };
            down_block_res_xs.extend(res_xs);
            xs = _xs;
        }
        // 4. mid
        let xs = self.mid_block.forward(&xs, Some(&emb), Some(encoder_hidden_states), injection);
        // 5. up
        let mut xs = xs;
        let mut upsample_size = None;
        for (i, up_block) in self.up_blocks.iter().enumerate() {
            let n_resnets = up_block.upblock().resnets.len();
            let res_xs = down_block_res_xs.split_off(down_block_res_xs.len() - n_resnets);
            if i < n_blocks - 1 && forward_upsample_size {
                let (_, _, h, w) = down_block_res_xs.last().unwrap().size4().unwrap();
                upsample_size = Some((h, w))
            }
            xs = match up_block {
                UNetUpBlock::Basic(b) => {
                    b.forward(&xs, &res_xs, Some(&emb), upsample_size, injection)
                }
                UNetUpBlock::CrossAttn(b) => b.forward(
                    &xs,
                    &res_xs,
                    Some(&emb),
                    upsample_size,
                    Some(encoder_hidden_states),
                    injection,
                ),
            };
        }
        // 6. post-process
        xs.apply(&self.conv_norm_out).silu().apply(&self.conv_out)
    }
}
