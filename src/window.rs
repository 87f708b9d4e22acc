//! Window partitioning for local attention.
//!
//! A feature map in channels-last layout is padded up to the next multiple of
//! the window size (bottom/right only, zero fill) and tiled into
//! non-overlapping square windows, flattening batch and window index
//! together. [`window_reverse`] inverts the tiling and crops the padding back
//! off, which is an exact round-trip for the unpadded region.

use candle_core::{Result, Tensor};

/// A window size of 0, or one covering the whole map, means the map is
/// treated as a single global window and partitioning is skipped.
pub fn is_global(window_size: usize, h: usize, w: usize) -> bool {
    window_size == 0 || window_size >= h.max(w)
}

/// Split `x` of shape `(B, H, W, C)` into `(B * num_windows, ws, ws, C)`
/// windows, returning the padded `(Hp, Wp)` needed to invert the split.
pub fn window_partition(x: &Tensor, window_size: usize) -> Result<(Tensor, (usize, usize))> {
    let (b, h, w, c) = x.dims4()?;
    let ws = window_size;

    let pad_h = (ws - h % ws) % ws;
    let pad_w = (ws - w % ws) % ws;
    let x = if pad_h > 0 || pad_w > 0 {
        x.pad_with_zeros(2, 0, pad_w)?.pad_with_zeros(1, 0, pad_h)?
    } else {
        x.clone()
    };
    let (hp, wp) = (h + pad_h, w + pad_w);

    // [B, Hp, Wp, C] -> [B, Hp/ws, ws, Wp/ws, ws, C] -> [B*nW, ws, ws, C]
    let x = x.reshape((b, hp / ws, ws, wp / ws, ws, c))?;
    let x = x.permute((0, 1, 3, 2, 4, 5))?.contiguous()?;
    let windows = x.reshape((b * (hp / ws) * (wp / ws), ws, ws, c))?;

    Ok((windows, (hp, wp)))
}

/// Reassemble windows of shape `(B * num_windows, ws, ws, C)` into
/// `(B, H, W, C)`, discarding the padding region.
pub fn window_reverse(
    windows: &Tensor,
    window_size: usize,
    pad_hw: (usize, usize),
    hw: (usize, usize),
) -> Result<Tensor> {
    let ws = window_size;
    let (hp, wp) = pad_hw;
    let (h, w) = hw;
    let (b_nw, _, _, c) = windows.dims4()?;
    let num_windows = (hp / ws) * (wp / ws);
    let b = b_nw / num_windows;

    let x = windows.reshape((b, hp / ws, wp / ws, ws, ws, c))?;
    let x = x.permute((0, 1, 3, 2, 4, 5))?.contiguous()?;
    let x = x.reshape((b, hp, wp, c))?;

    if hp > h || wp > w {
        x.narrow(1, 0, h)?.narrow(2, 0, w)
    } else {
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn sample(b: usize, h: usize, w: usize, c: usize) -> Tensor {
        let n = (b * h * w * c) as u32;
        Tensor::arange(0u32, n, &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .reshape((b, h, w, c))
            .unwrap()
    }

    #[test]
    fn round_trip_exact_multiple() {
        let x = sample(2, 8, 8, 3);
        let (windows, pad_hw) = window_partition(&x, 4).unwrap();
        assert_eq!(windows.dims(), &[2 * 4, 4, 4, 3]);
        assert_eq!(pad_hw, (8, 8));

        let back = window_reverse(&windows, 4, pad_hw, (8, 8)).unwrap();
        assert_eq!(
            x.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            back.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        );
    }

    #[test]
    fn round_trip_with_padding() {
        // 10x13 is not a multiple of 4; padding goes bottom/right only.
        let x = sample(1, 10, 13, 2);
        let (windows, (hp, wp)) = window_partition(&x, 4).unwrap();
        assert_eq!((hp, wp), (12, 16));
        assert_eq!(windows.dims(), &[(12 / 4) * (16 / 4), 4, 4, 2]);

        let back = window_reverse(&windows, 4, (hp, wp), (10, 13)).unwrap();
        assert_eq!(back.dims(), &[1, 10, 13, 2]);
        assert_eq!(
            x.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            back.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
        );
    }

    #[test]
    fn padding_region_is_zero_filled() {
        let x = Tensor::ones((1, 3, 3, 1), DType::F32, &Device::Cpu).unwrap();
        let (windows, (hp, wp)) = window_partition(&x, 4).unwrap();
        assert_eq!((hp, wp), (4, 4));
        let sum = windows.sum_all().unwrap().to_scalar::<f32>().unwrap();
        // only the 3x3 original contributes
        assert_eq!(sum, 9.0);
    }

    #[test]
    fn global_window_detection() {
        assert!(is_global(0, 14, 14));
        assert!(is_global(14, 14, 14));
        assert!(is_global(16, 14, 14));
        assert!(!is_global(7, 14, 14));
        assert!(!is_global(7, 4, 8));
    }
}
