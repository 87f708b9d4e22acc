//! The two attention formulations used by the backbone.
//!
//! [`SpatialAttention`] is standard scaled multi-head self-attention over a
//! window (or the whole map when windowing is bypassed), quadratic in token
//! count, with an optional query-only max-pool that realizes stage-boundary
//! downsampling inside the attention itself. [`ChannelAttention`] contracts
//! over the token axis instead, producing a head_dim x head_dim attention
//! matrix, and is linear in token count.

use candle_core::{Module, Result, Tensor, D};
use candle_nn::{Linear, VarBuilder};

/// Which attention formulation a block position uses. Chosen once at
/// construction, dispatched as a tagged variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum AttentionType {
    Spatial,
    Channel,
}

/// Windowed (or global) multi-head self-attention with optional query
/// pooling. Operates on `(B, H, W, C)` maps; windows arrive as
/// `(B * num_windows, ws, ws, C)` which is the same layout.
pub struct SpatialAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    dim_out: usize,
    scale: f64,
    q_stride: Option<usize>,
}

impl SpatialAttention {
    pub fn new(
        dim: usize,
        dim_out: usize,
        num_heads: usize,
        qkv_bias: bool,
        q_stride: Option<usize>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let head_dim = dim_out / num_heads;
        let scale = (head_dim as f64).powf(-0.5);
        let qkv = if qkv_bias {
            candle_nn::linear(dim, dim_out * 3, vb.pp("qkv"))?
        } else {
            candle_nn::linear_no_bias(dim, dim_out * 3, vb.pp("qkv"))?
        };
        let proj = candle_nn::linear(dim_out, dim_out, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            proj,
            num_heads,
            dim_out,
            scale,
            q_stride,
        })
    }

    /// `(B, H, W, C_in)` in, `(B, H', W', C_out)` out. H'/W' shrink by the
    /// query-pool stride when one is configured, otherwise stay unchanged.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, h, w, _) = x.dims4()?;
        let n = h * w;
        let head_dim = self.dim_out / self.num_heads;

        let qkv = self.qkv.forward(&x.reshape((b, n, ()))?)?;
        let qkv = qkv.reshape((b, n, 3, self.num_heads, head_dim))?;
        let q = qkv.narrow(2, 0, 1)?.squeeze(2)?;
        let k = qkv.narrow(2, 1, 1)?.squeeze(2)?;
        let v = qkv.narrow(2, 2, 1)?.squeeze(2)?;

        // Query pooling shrinks the output token count while keys/values
        // keep full-resolution context.
        let (q, out_h, out_w) = match self.q_stride {
            Some(stride) => {
                let q = q.reshape((b, h, w, self.dim_out))?;
                let q = q.permute((0, 3, 1, 2))?.contiguous()?;
                let q = q.max_pool2d_with_stride(stride, stride)?;
                let (_, _, ph, pw) = q.dims4()?;
                let q = q.permute((0, 2, 3, 1))?.contiguous()?;
                let q = q.reshape((b, ph * pw, self.num_heads, head_dim))?;
                (q, ph, pw)
            }
            None => (q, h, w),
        };

        // [B, N, heads, head_dim] -> [B, heads, N, head_dim]
        let q = q.permute((0, 2, 1, 3))?.contiguous()?;
        let k = k.permute((0, 2, 1, 3))?.contiguous()?;
        let v = v.permute((0, 2, 1, 3))?.contiguous()?;

        let q = (q * self.scale)?;
        let attn = q.matmul(&k.transpose(D::Minus2, D::Minus1)?)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let x = attn.matmul(&v)?;

        let x = x.transpose(1, 2)?.reshape((b, out_h * out_w, self.dim_out))?;
        let x = self.proj.forward(&x)?;
        x.reshape((b, out_h, out_w, self.dim_out))
    }
}

/// Linear-complexity attention across the channel axis. The softmax is taken
/// after contracting keys and values over tokens, so the attention matrix is
/// head_dim x head_dim and cost never grows quadratically with resolution.
pub struct ChannelAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    scale: f64,
}

impl ChannelAttention {
    pub fn new(dim: usize, num_heads: usize, qkv_bias: bool, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / num_heads;
        let scale = (head_dim as f64).powf(-0.5);
        let qkv = if qkv_bias {
            candle_nn::linear(dim, dim * 3, vb.pp("qkv"))?
        } else {
            candle_nn::linear_no_bias(dim, dim * 3, vb.pp("qkv"))?
        };
        let proj = candle_nn::linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            proj,
            num_heads,
            scale,
        })
    }

    /// `(B, N, C)` in, `(B, N, C)` out.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, n, c) = x.dims3()?;
        let head_dim = c / self.num_heads;

        let qkv = self.qkv.forward(x)?;
        let qkv = qkv.reshape((b, n, 3, self.num_heads, head_dim))?;
        let qkv = qkv.permute((2, 0, 3, 1, 4))?.contiguous()?;
        let q = qkv.get(0)?;
        let k = qkv.get(1)?;
        let v = qkv.get(2)?;

        let k = (k * self.scale)?;
        let attn = k.transpose(D::Minus2, D::Minus1)?.matmul(&v)?;
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;

        let x = attn.matmul(&q.transpose(D::Minus2, D::Minus1)?)?;
        let x = x.transpose(D::Minus2, D::Minus1)?;
        let x = x.transpose(1, 2)?.reshape((b, n, c))?;
        self.proj.forward(&x)
    }
}

/// Per-block attention variant, fixed at construction.
pub enum Attention {
    Spatial(SpatialAttention),
    Channel(ChannelAttention),
}
