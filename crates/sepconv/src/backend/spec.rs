//! Backend contract: handle materialization, the kernels layers need, and explicit release.
//!
//! Functional ops validate shapes and resolve padding before calling into a backend, so every
//! spec handed to a backend is fully static and already consistent with its operands.

use thiserror::Error;

use crate::tensor::Tensor;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// Explicit zero padding per spatial edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Padding2d {
    pub top: usize,
    pub bottom: usize,
    pub left: usize,
    pub right: usize,
}

impl Padding2d {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Depthwise (channel multiplier 1) followed by pointwise convolution over NHWC input.
///
/// - `input`: `[N, H, W, C_in]`
/// - depthwise filter: `[KH, KW, C_in, 1]`
/// - pointwise filter: `[1, 1, C_in, C_out]`
/// - `output`: `[N, H_out, W_out, C_out]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeparableConv2dSpec {
    pub input: [usize; 4],
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: Padding2d,
    pub output: [usize; 4],
}

/// Per-channel op over a tensor whose innermost axis holds channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelwiseSpec {
    pub dims: Vec<usize>,
}

impl ChannelwiseSpec {
    pub fn channels(&self) -> usize {
        self.dims.last().copied().unwrap_or(0)
    }
}

/// Inference-mode batch normalization over the innermost (channel) axis.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchNormSpec {
    pub dims: Vec<usize>,
    pub epsilon: f32,
}

impl BatchNormSpec {
    pub fn channels(&self) -> usize {
        self.dims.last().copied().unwrap_or(0)
    }
}

/// Tensor engine evaluating the kernels a depthwise separable layer is composed of.
///
/// Every handle returned by `materialize` or an operation is owned by the caller and must be
/// passed to `release` exactly once.
pub trait TensorBackend: Send + Sync {
    type TensorHandle: Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Uploads a host tensor.
    fn materialize(&self, tensor: &Tensor) -> BackendResult<Self::TensorHandle>;

    /// Downloads a handle back into host memory.
    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor>;

    fn separable_conv2d(
        &self,
        input: &Self::TensorHandle,
        depthwise: &Self::TensorHandle,
        pointwise: &Self::TensorHandle,
        spec: &SeparableConv2dSpec,
    ) -> BackendResult<Self::TensorHandle>;

    /// Adds a `[C]` bias vector to every position of the input.
    fn bias_add(
        &self,
        input: &Self::TensorHandle,
        bias: &Self::TensorHandle,
        spec: &ChannelwiseSpec,
    ) -> BackendResult<Self::TensorHandle>;

    /// Computes `(x - mean) / sqrt(variance + epsilon) * scale + offset` per channel.
    ///
    /// A missing `scale` behaves as ones and a missing `offset` as zeros.
    fn batch_norm(
        &self,
        input: &Self::TensorHandle,
        mean: &Self::TensorHandle,
        variance: &Self::TensorHandle,
        scale: Option<&Self::TensorHandle>,
        offset: Option<&Self::TensorHandle>,
        spec: &BatchNormSpec,
    ) -> BackendResult<Self::TensorHandle>;

    /// Returns the memory behind `tensor` to the backend.
    fn release(&self, tensor: Self::TensorHandle) -> BackendResult<()>;
}
