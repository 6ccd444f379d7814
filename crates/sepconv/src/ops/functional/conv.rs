//! Depthwise separable convolution over NHWC activations.

use std::sync::Arc;

use crate::backend::shape_helpers::resolve_padding_2d;
use crate::backend::{PaddingMode, SeparableConv2dSpec, TensorBackend};
use crate::error::{LayerError, Result};
use crate::tensor::{DeviceTensor, Shape};

/// Depthwise convolution followed by a 1x1 pointwise projection.
///
/// - `x`: `[N, H, W, C_in]`
/// - `depthwise`: `[KH, KW, C_in, 1]`
/// - `pointwise`: `[1, 1, C_in, C_out]`
///
/// Returns `[N, H_out, W_out, C_out]`; the depthwise intermediate never leaves the backend.
pub fn separable_conv2d<B: TensorBackend + 'static>(
    x: &DeviceTensor<B>,
    depthwise: &DeviceTensor<B>,
    pointwise: &DeviceTensor<B>,
    stride: [usize; 2],
    padding: PaddingMode,
) -> Result<DeviceTensor<B>> {
    let spec = validate_separable_inputs(
        x.shape(),
        depthwise.shape(),
        pointwise.shape(),
        stride,
        padding,
    )?;
    let backend = Arc::clone(x.backend());
    let handle =
        backend.separable_conv2d(x.handle(), depthwise.handle(), pointwise.handle(), &spec)?;
    Ok(DeviceTensor::from_handle(backend, Shape::new(spec.output), handle))
}

fn validate_separable_inputs(
    x: &Shape,
    depthwise: &Shape,
    pointwise: &Shape,
    stride: [usize; 2],
    padding: PaddingMode,
) -> Result<SeparableConv2dSpec> {
    if x.rank() != 4 {
        return Err(LayerError::InvalidInput(format!(
            "separable_conv2d expects rank-4 NHWC input, got {x}"
        )));
    }
    let dims = x.dims();
    let (n, h, w, c_in) = (dims[0], dims[1], dims[2], dims[3]);

    let dw = depthwise.dims();
    if depthwise.rank() != 4 || dw[2] != c_in || dw[3] != 1 {
        return Err(LayerError::InvalidInput(format!(
            "separable_conv2d depthwise filter must be [KH, KW, {c_in}, 1], got {depthwise}"
        )));
    }
    let pw = pointwise.dims();
    if pointwise.rank() != 4 || pw[0] != 1 || pw[1] != 1 || pw[2] != c_in {
        return Err(LayerError::InvalidInput(format!(
            "separable_conv2d pointwise filter must be [1, 1, {c_in}, C_out], got {pointwise}"
        )));
    }
    let c_out = pw[3];
    let kernel = [dw[0], dw[1]];

    let ([out_h, out_w], padding) = resolve_padding_2d(padding, [h, w], kernel, stride)?;
    Ok(SeparableConv2dSpec {
        input: [n, h, w, c_in],
        kernel,
        stride,
        padding,
        output: [n, out_h, out_w, c_out],
    })
}
