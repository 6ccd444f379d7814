//! Per-channel post-processing kernels: bias addition and inference batch normalization.

use std::sync::Arc;

use crate::backend::{BatchNormSpec, ChannelwiseSpec, TensorBackend};
use crate::error::{LayerError, Result};
use crate::tensor::{DeviceTensor, Shape};

fn expect_channel_vector<B: TensorBackend + 'static>(
    op: &str,
    role: &str,
    tensor: &DeviceTensor<B>,
    channels: usize,
) -> Result<()> {
    let shape = tensor.shape();
    if shape.rank() != 1 || shape.dims()[0] != channels {
        return Err(LayerError::InvalidInput(format!(
            "{op} expects {role} of shape [{channels}], got {shape}"
        )));
    }
    Ok(())
}

/// Adds a `[C]` bias to every position of `x`, broadcasting over all leading axes.
pub fn bias_add<B: TensorBackend + 'static>(
    x: &DeviceTensor<B>,
    bias: &DeviceTensor<B>,
) -> Result<DeviceTensor<B>> {
    let channels = x.shape().last_dim();
    expect_channel_vector("bias_add", "bias", bias, channels)?;

    let spec = ChannelwiseSpec {
        dims: x.shape().dims().to_vec(),
    };
    let backend = Arc::clone(x.backend());
    let handle = backend.bias_add(x.handle(), bias.handle(), &spec)?;
    Ok(DeviceTensor::from_handle(backend, x.shape().clone(), handle))
}

/// Normalizes `x` per channel with frozen statistics.
pub fn batch_norm<B: TensorBackend + 'static>(
    x: &DeviceTensor<B>,
    mean: &DeviceTensor<B>,
    variance: &DeviceTensor<B>,
    scale: Option<&DeviceTensor<B>>,
    offset: Option<&DeviceTensor<B>>,
    epsilon: f32,
) -> Result<DeviceTensor<B>> {
    let channels = x.shape().last_dim();
    expect_channel_vector("batch_norm", "mean", mean, channels)?;
    expect_channel_vector("batch_norm", "variance", variance, channels)?;
    if let Some(scale) = scale {
        expect_channel_vector("batch_norm", "scale", scale, channels)?;
    }
    if let Some(offset) = offset {
        expect_channel_vector("batch_norm", "offset", offset, channels)?;
    }
    if !(epsilon.is_finite() && epsilon > 0.0) {
        return Err(LayerError::InvalidInput(format!(
            "batch_norm epsilon must be finite and > 0, got {epsilon}"
        )));
    }

    let spec = BatchNormSpec {
        dims: x.shape().dims().to_vec(),
        epsilon,
    };
    let backend = Arc::clone(x.backend());
    let handle = backend.batch_norm(
        x.handle(),
        mean.handle(),
        variance.handle(),
        scale.map(DeviceTensor::handle),
        offset.map(DeviceTensor::handle),
        &spec,
    )?;
    Ok(DeviceTensor::from_handle(backend, Shape::new(spec.dims), handle))
}
