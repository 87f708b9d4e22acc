//! Patch embedding and absolute positional bias.
//!
//! Size-agnostic strided-convolution embedding: the initial embed projects
//! raw pixels with a large overlapping kernel, inter-stage embeds re-project
//! the previous stage's feature map at stride 2. Inputs whose spatial size is
//! not a multiple of the stride are zero-padded on the bottom/right edges
//! before the convolution, so any input size is accepted.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, LayerNorm, VarBuilder};

enum EmbedKind {
    /// Operates on raw pixels in `(B, C, H, W)` layout, normalizes the output.
    Initial,
    /// Operates on the previous stage's `(B, H, W, C)` map, normalizes the
    /// incoming channels first.
    Transition,
}

pub struct PatchEmbed {
    proj: Conv2d,
    norm: LayerNorm,
    kind: EmbedKind,
    stride: usize,
}

impl PatchEmbed {
    /// Initial patchify: kernel 7, stride `patch_size`, padding 3.
    pub fn initial(
        in_chans: usize,
        embed_dim: usize,
        patch_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: patch_size,
            padding: 3,
            ..Default::default()
        };
        let proj = candle_nn::conv2d(in_chans, embed_dim, 7, cfg, vb.pp("proj"))?;
        let norm = candle_nn::layer_norm(embed_dim, 1e-5, vb.pp("norm"))?;
        Ok(Self {
            proj,
            norm,
            kind: EmbedKind::Initial,
            stride: patch_size,
        })
    }

    /// Inter-stage re-embedding at stride 2. `overlapped` selects a 3x3
    /// kernel with padding 1 instead of the non-overlapping 2x2 one.
    pub fn transition(
        in_chans: usize,
        embed_dim: usize,
        overlapped: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kernel, padding) = if overlapped { (3, 1) } else { (2, 0) };
        let cfg = Conv2dConfig {
            stride: 2,
            padding,
            ..Default::default()
        };
        let proj = candle_nn::conv2d(in_chans, embed_dim, kernel, cfg, vb.pp("proj"))?;
        let norm = candle_nn::layer_norm(in_chans, 1e-5, vb.pp("norm"))?;
        Ok(Self {
            proj,
            norm,
            kind: EmbedKind::Transition,
            stride: 2,
        })
    }

    /// Embed `x` and return the map in `(B, H', W', C')` layout together with
    /// its new spatial size. The expected input layout depends on the embed
    /// kind, see the constructors.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, (usize, usize))> {
        let x = match self.kind {
            EmbedKind::Initial => x.clone(),
            EmbedKind::Transition => {
                // normalize incoming channels, then move to NCHW for the conv
                let x = self.norm.forward(x)?;
                x.permute((0, 3, 1, 2))?.contiguous()?
            }
        };

        let (_, _, h, w) = x.dims4()?;
        let pad_w = (self.stride - w % self.stride) % self.stride;
        let pad_h = (self.stride - h % self.stride) % self.stride;
        let x = if pad_w > 0 || pad_h > 0 {
            x.pad_with_zeros(3, 0, pad_w)?.pad_with_zeros(2, 0, pad_h)?
        } else {
            x
        };

        let x = self.proj.forward(&x)?;
        let (_, _, new_h, new_w) = x.dims4()?;
        let x = x.permute((0, 2, 3, 1))?.contiguous()?;

        let x = match self.kind {
            EmbedKind::Initial => self.norm.forward(&x)?,
            EmbedKind::Transition => x,
        };
        Ok((x, (new_h, new_w)))
    }
}

/// Learned absolute position bias, stored at a fixed seed resolution and
/// resized to the running one, plus a window-sized bias tiled across the map
/// and added on top. Applied once, right after the initial patch embed.
pub struct PosEmbed {
    pos: Tensor,
    window: Tensor,
}

impl PosEmbed {
    pub fn new(
        dim: usize,
        global_size: (usize, usize),
        window_size: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let pos = vb.get((1, dim, global_size.0, global_size.1), "pos_embed")?;
        let window = vb.get((1, dim, window_size, window_size), "pos_embed_window")?;
        Ok(Self { pos, window })
    }

    /// Add the positional bias to `x` in `(B, H, W, C)` layout.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, h, w, _) = x.dims4()?;
        let pos = self.pos.upsample_nearest2d(h, w)?;

        let (_, _, wh, ww) = self.window.dims4()?;
        let tile_h = (h + wh - 1) / wh;
        let tile_w = (w + ww - 1) / ww;
        let tiled = self
            .window
            .repeat((1, 1, tile_h, tile_w))?
            .narrow(2, 0, h)?
            .narrow(3, 0, w)?;

        let pos = (pos + tiled)?.permute((0, 2, 3, 1))?.contiguous()?;
        x.broadcast_add(&pos)
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

    #[test]
    fn initial_embed_pads_to_ceil() {
        let (_m, vb) = vb();
        let embed = PatchEmbed::initial(3, 16, 4, vb).unwrap();
        // 30 is not a multiple of 4; output size must be ceil(30/4) = 8
        let x = Tensor::zeros((1, 3, 30, 30), DType::F32, &Device::Cpu).unwrap();
        let (out, (h, w)) = embed.forward(&x).unwrap();
        assert_eq!((h, w), (8, 8));
        assert_eq!(out.dims(), &[1, 8, 8, 16]);
    }

    #[test]
    fn transition_embed_halves_resolution() {
        let (_m, vb) = vb();
        let embed = PatchEmbed::transition(16, 32, false, vb).unwrap();
        let x = Tensor::zeros((2, 14, 14, 16), DType::F32, &Device::Cpu).unwrap();
        let (out, (h, w)) = embed.forward(&x).unwrap();
        assert_eq!((h, w), (7, 7));
        assert_eq!(out.dims(), &[2, 7, 7, 32]);
    }

    #[test]
    fn overlapped_transition_keeps_output_size() {
        let (_m, vb) = vb();
        let embed = PatchEmbed::transition(16, 32, true, vb).unwrap();
        let x = Tensor::zeros((1, 9, 9, 16), DType::F32, &Device::Cpu).unwrap();
        let (out, (h, w)) = embed.forward(&x).unwrap();
        // padded to 10, conv k3 s2 p1 -> 5 = ceil(9/2)
        assert_eq!((h, w), (5, 5));
        assert_eq!(out.dims(), &[1, 5, 5, 32]);
    }

    #[test]
    fn pos_embed_preserves_shape() {
        let (_m, vb) = vb();
        let pe = PosEmbed::new(8, (7, 7), 4, vb).unwrap();
        let x = Tensor::zeros((2, 13, 11, 8), DType::F32, &Device::Cpu).unwrap();
        let out = pe.forward(&x).unwrap();
        assert_eq!(out.dims(), &[2, 13, 11, 8]);
    }
}
