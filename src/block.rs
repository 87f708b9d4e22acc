//! Transformer block composition.
//!
//! A [`MultiScaleBlock`] runs one attention variant plus an MLP, each behind
//! a pre-norm residual. Depthwise-conv position encodings are injected before
//! both sub-layers. When the block changes channel width the residual
//! shortcut is projected from the pre-norm input and pooled exactly like the
//! attention queries so the shapes line up for the residual add.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};

use crate::attention::{Attention, AttentionType, ChannelAttention, SpatialAttention};
use crate::error::ModelError;
use crate::window::{is_global, window_partition, window_reverse};

/// MLP block
pub struct Mlp {
    fc1: Linear,
    fc2: Linear,
}

impl Mlp {
    pub fn new(in_features: usize, hidden_features: usize, vb: VarBuilder) -> Result<Self> {
        let fc1 = candle_nn::linear(in_features, hidden_features, vb.pp("fc1"))?;
        let fc2 = candle_nn::linear(hidden_features, in_features, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.fc1.forward(x)?;
        let x = x.gelu_erf()?;
        self.fc2.forward(&x)
    }
}

/// Depthwise-convolution position encoding, added residually:
/// `x + act(conv_dw(x))`.
pub struct ConvPosEnc {
    proj: Conv2d,
    act: bool,
}

impl ConvPosEnc {
    pub fn new(dim: usize, act: bool, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            groups: dim,
            ..Default::default()
        };
        let proj = candle_nn::conv2d(dim, dim, 3, cfg, vb.pp("proj"))?;
        Ok(Self { proj, act })
    }

    /// `(B, H, W, C)` in and out.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let feat = x.permute((0, 3, 1, 2))?.contiguous()?;
        let feat = self.proj.forward(&feat)?;
        let feat = feat.permute((0, 2, 3, 1))?.contiguous()?;
        let feat = if self.act { feat.gelu_erf()? } else { feat };
        x + feat
    }
}

/// Stochastic depth over a residual branch. During training each sample's
/// branch output is dropped with probability `prob` and survivors are scaled
/// by `1 / (1 - prob)`, so inference applies the full branch output with no
/// correction factor.
pub struct DropPath {
    prob: f64,
}

impl DropPath {
    pub fn new(prob: f64) -> Self {
        Self { prob }
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        if !train || self.prob == 0.0 {
            return Ok(x.clone());
        }
        let keep = 1.0 - self.prob;
        let b = x.dim(0)?;
        let mask = Tensor::rand(0f32, 1f32, (b, 1, 1, 1), x.device())?;
        let mask = mask.lt(keep as f32)?.to_dtype(x.dtype())?;
        x.broadcast_mul(&mask)? * (1.0 / keep)
    }
}

pub struct BlockConfig {
    pub dim: usize,
    pub dim_out: usize,
    pub num_heads: usize,
    pub attention: AttentionType,
    pub window_size: usize,
    pub q_stride: Option<usize>,
    pub mlp_ratio: f64,
    pub qkv_bias: bool,
    pub drop_path: f64,
    pub cpe_act: bool,
}

/// One block of the hierarchy: conv position encoding, attention (windowed
/// spatial or channel), conv position encoding again, MLP.
pub struct MultiScaleBlock {
    cpe1: ConvPosEnc,
    norm1: LayerNorm,
    attn: Attention,
    shortcut_proj: Option<Linear>,
    cpe2: ConvPosEnc,
    norm2: LayerNorm,
    mlp: Mlp,
    drop_path: DropPath,
    dim: usize,
    dim_out: usize,
    window_size: usize,
    q_stride: Option<usize>,
}

impl MultiScaleBlock {
    pub fn new(cfg: BlockConfig, vb: VarBuilder) -> Result<Self> {
        if cfg.dim_out % cfg.num_heads != 0 {
            return Err(ModelError::config(format!(
                "dim_out {} not divisible by num_heads {}",
                cfg.dim_out, cfg.num_heads
            ))
            .into());
        }

        let cpe1 = ConvPosEnc::new(cfg.dim, cfg.cpe_act, vb.pp("cpe.0"))?;
        let norm1 = candle_nn::layer_norm(cfg.dim, 1e-5, vb.pp("norm1"))?;

        let attn = match cfg.attention {
            AttentionType::Spatial => Attention::Spatial(SpatialAttention::new(
                cfg.dim,
                cfg.dim_out,
                cfg.num_heads,
                cfg.qkv_bias,
                cfg.q_stride,
                vb.pp("attn"),
            )?),
            AttentionType::Channel => {
                if cfg.dim != cfg.dim_out {
                    return Err(ModelError::config(format!(
                        "channel attention cannot change width (dim {} -> dim_out {})",
                        cfg.dim, cfg.dim_out
                    ))
                    .into());
                }
                if cfg.q_stride.is_some() {
                    return Err(ModelError::config(
                        "query pooling requires a spatial attention block",
                    )
                    .into());
                }
                Attention::Channel(ChannelAttention::new(
                    cfg.dim,
                    cfg.num_heads,
                    cfg.qkv_bias,
                    vb.pp("attn"),
                )?)
            }
        };

        let shortcut_proj = if cfg.dim != cfg.dim_out {
            Some(candle_nn::linear(cfg.dim, cfg.dim_out, vb.pp("proj"))?)
        } else {
            None
        };

        let cpe2 = ConvPosEnc::new(cfg.dim_out, cfg.cpe_act, vb.pp("cpe.1"))?;
        let norm2 = candle_nn::layer_norm(cfg.dim_out, 1e-5, vb.pp("norm2"))?;
        let mlp_hidden = (cfg.dim_out as f64 * cfg.mlp_ratio) as usize;
        let mlp = Mlp::new(cfg.dim_out, mlp_hidden, vb.pp("mlp"))?;

        Ok(Self {
            cpe1,
            norm1,
            attn,
            shortcut_proj,
            cpe2,
            norm2,
            mlp,
            drop_path: DropPath::new(cfg.drop_path),
            dim: cfg.dim,
            dim_out: cfg.dim_out,
            window_size: cfg.window_size,
            q_stride: cfg.q_stride,
        })
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    fn pool_map(&self, x: &Tensor, stride: usize) -> Result<Tensor> {
        let x = x.permute((0, 3, 1, 2))?.contiguous()?;
        let x = x.max_pool2d_with_stride(stride, stride)?;
        x.permute((0, 2, 3, 1))?.contiguous()
    }

    /// `(B, H, W, C)` in, `(B, H', W', C')` out. The spatial size changes
    /// only when query pooling is configured on this block.
    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.cpe1.forward(x)?;
        let (b, h, w, _) = x.dims4()?;

        if let Some(stride) = self.q_stride {
            if h < stride || w < stride {
                return Err(ModelError::shape(
                    "query pooling",
                    format!("spatial size of at least {stride}x{stride}"),
                    format!("{h}x{w}"),
                )
                .into());
            }
        }

        // Shortcut is the pre-norm input, projected and pooled to match the
        // attention branch when the block changes width.
        let shortcut = match &self.shortcut_proj {
            Some(proj) => {
                let s = proj.forward(&x.reshape((b, h * w, self.dim))?)?;
                let s = s.reshape((b, h, w, self.dim_out))?;
                match self.q_stride {
                    Some(stride) => self.pool_map(&s, stride)?,
                    None => s,
                }
            }
            None => match self.q_stride {
                Some(stride) => self.pool_map(&x, stride)?,
                None => x.clone(),
            },
        };

        let normed = self.norm1.forward(&x)?;

        let attn_out = match &self.attn {
            Attention::Channel(attn) => {
                let cur = attn.forward(&normed.reshape((b, h * w, self.dim))?)?;
                cur.reshape((b, h, w, self.dim_out))?
            }
            Attention::Spatial(attn) => {
                if is_global(self.window_size, h, w) {
                    attn.forward(&normed)?
                } else {
                    let ws = self.window_size;
                    let (windows, (hp, wp)) = window_partition(&normed, ws)?;
                    let attn_windows = attn.forward(&windows)?;

                    match self.q_stride {
                        None => window_reverse(&attn_windows, ws, (hp, wp), (h, w))?,
                        Some(stride) => {
                            // Query pooling shrank every window; reassemble on
                            // the pooled grid and crop to the pooled map size.
                            let pooled_ws = ws / stride;
                            let (out_h, out_w) = (shortcut.dim(1)?, shortcut.dim(2)?);
                            let pad_hw = ((hp / ws) * pooled_ws, (wp / ws) * pooled_ws);
                            window_reverse(&attn_windows, pooled_ws, pad_hw, (out_h, out_w))?
                        }
                    }
                }
            }
        };

        let x = (shortcut + self.drop_path.forward(&attn_out, train)?)?;

        let x = self.cpe2.forward(&x)?;
        let (b, h, w, _) = x.dims4()?;
        let cur = self.norm2.forward(&x)?;
        let cur = self.mlp.forward(&cur.reshape((b, h * w, self.dim_out))?)?;
        let cur = cur.reshape((b, h, w, self.dim_out))?;
        &x + self.drop_path.forward(&cur, train)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn vb() -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        (varmap, vb)
    }

    fn block(cfg: BlockConfig) -> MultiScaleBlock {
        let (_m, vb) = vb();
        MultiScaleBlock::new(cfg, vb).unwrap()
    }

    fn base_cfg() -> BlockConfig {
        BlockConfig {
            dim: 16,
            dim_out: 16,
            num_heads: 4,
            attention: AttentionType::Spatial,
            window_size: 4,
            q_stride: None,
            mlp_ratio: 4.0,
            qkv_bias: true,
            drop_path: 0.0,
            cpe_act: false,
        }
    }

    #[test]
    fn spatial_block_preserves_shape() {
        let blk = block(base_cfg());
        // 10x7 is not a window multiple; padding must stay invisible
        let x = Tensor::randn(0f32, 1f32, (2, 10, 7, 16), &Device::Cpu).unwrap();
        let out = blk.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[2, 10, 7, 16]);
    }

    #[test]
    fn channel_block_preserves_shape() {
        let blk = block(BlockConfig {
            attention: AttentionType::Channel,
            window_size: 0,
            ..base_cfg()
        });
        let x = Tensor::randn(0f32, 1f32, (1, 9, 11, 16), &Device::Cpu).unwrap();
        let out = blk.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[1, 9, 11, 16]);
    }

    #[test]
    fn transition_block_pools_and_widens() {
        let blk = block(BlockConfig {
            dim_out: 32,
            q_stride: Some(2),
            ..base_cfg()
        });
        let x = Tensor::randn(0f32, 1f32, (1, 8, 8, 16), &Device::Cpu).unwrap();
        let out = blk.forward(&x, false).unwrap();
        // 64 tokens -> 16, width x2
        assert_eq!(out.dims(), &[1, 4, 4, 32]);
    }

    #[test]
    fn global_window_transition_block() {
        let blk = block(BlockConfig {
            dim_out: 32,
            q_stride: Some(2),
            window_size: 0,
            ..base_cfg()
        });
        let x = Tensor::randn(0f32, 1f32, (1, 6, 6, 16), &Device::Cpu).unwrap();
        let out = blk.forward(&x, false).unwrap();
        assert_eq!(out.dims(), &[1, 3, 3, 32]);
    }

    #[test]
    fn too_small_input_for_pooling_is_a_shape_error() {
        let blk = block(BlockConfig {
            dim_out: 32,
            q_stride: Some(2),
            ..base_cfg()
        });
        let x = Tensor::randn(0f32, 1f32, (1, 1, 1, 16), &Device::Cpu).unwrap();
        let err = blk.forward(&x, false).unwrap_err();
        assert!(err.to_string().contains("query pooling"));
    }

    #[test]
    fn channel_attention_cannot_pool_queries() {
        let (_m, vb) = vb();
        let result = MultiScaleBlock::new(
            BlockConfig {
                attention: AttentionType::Channel,
                q_stride: Some(2),
                ..base_cfg()
            },
            vb,
        );
        let err = match result {
            Ok(_) => panic!("construction must reject a pooled channel block"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("spatial attention"));
    }

    #[test]
    fn drop_path_is_identity_at_inference() {
        let dp = DropPath::new(0.5);
        let x = Tensor::randn(0f32, 1f32, (2, 4, 4, 8), &Device::Cpu).unwrap();
        let out = dp.forward(&x, false).unwrap();
        assert_eq!(
            x.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            out.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        );
    }

    #[test]
    fn drop_path_scales_survivors() {
        // prob 0 keeps everything even in training mode
        let dp = DropPath::new(0.0);
        let x = Tensor::ones((3, 2, 2, 4), DType::F32, &Device::Cpu).unwrap();
        let out = dp.forward(&x, true).unwrap();
        assert_eq!(out.sum_all().unwrap().to_scalar::<f32>().unwrap(), 48.0);
    }
}
