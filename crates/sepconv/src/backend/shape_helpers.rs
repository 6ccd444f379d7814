//! Shared output-size and padding arithmetic for windowed ops.

use crate::backend::spec::Padding2d;
use crate::error::{LayerError, Result};

/// Padding policy for windowed ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingMode {
    /// Zero-pad so that `out = ceil(in / stride)`; an odd leftover pixel goes to the trailing edge.
    #[default]
    Same,
    /// No padding; the window must fit inside the input.
    Valid,
}

/// Output length and `(before, after)` padding of one spatial axis.
pub fn resolve_axis(
    mode: PaddingMode,
    input: usize,
    window: usize,
    stride: usize,
) -> Result<(usize, usize, usize)> {
    if window == 0 || stride == 0 {
        return Err(LayerError::InvalidInput(format!(
            "window ({window}) and stride ({stride}) must be > 0"
        )));
    }
    if input == 0 {
        return Err(LayerError::InvalidInput(
            "spatial dimensions must be > 0".to_string(),
        ));
    }
    match mode {
        PaddingMode::Same => {
            let out = input.div_ceil(stride);
            let needed = (out - 1) * stride + window;
            let total = needed.saturating_sub(input);
            let before = total / 2;
            Ok((out, before, total - before))
        }
        PaddingMode::Valid => {
            if input < window {
                return Err(LayerError::InvalidInput(format!(
                    "window ({window}) exceeds input ({input}) without padding"
                )));
            }
            Ok(((input - window) / stride + 1, 0, 0))
        }
    }
}

/// Resolves output height/width and explicit padding for a 2D window over `[H, W]`.
pub fn resolve_padding_2d(
    mode: PaddingMode,
    input_hw: [usize; 2],
    kernel: [usize; 2],
    stride: [usize; 2],
) -> Result<([usize; 2], Padding2d)> {
    let (out_h, top, bottom) = resolve_axis(mode, input_hw[0], kernel[0], stride[0])?;
    let (out_w, left, right) = resolve_axis(mode, input_hw[1], kernel[1], stride[1])?;
    Ok((
        [out_h, out_w],
        Padding2d {
            top,
            bottom,
            left,
            right,
        },
    ))
}
