//! Layer lifecycle contract and the concrete layers implementing it.

pub mod batch_norm;
pub mod bias;
pub mod post_process;
pub mod separable_conv;

pub use batch_norm::BatchNorm;
pub use bias::Bias;
pub use post_process::PostProcessor;
pub use separable_conv::DepthwiseSeparableConv;

use std::fmt;

use crate::backend::TensorBackend;
use crate::error::{LayerError, Result};
use crate::params;
use crate::tensor::{DeviceTensor, Shape};
use crate::weights::{ExtractWeights, WeightMap};

/// Lifecycle position of a layer's parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerState {
    Uninitialized,
    Ready,
    Disposed,
}

impl fmt::Display for LayerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LayerState::Uninitialized => "uninitialized",
            LayerState::Ready => "ready",
            LayerState::Disposed => "disposed",
        })
    }
}

/// Uniform lifecycle shared by every layer, including nested post-processing components.
///
/// Exactly one of [`Layer::initialize_params`] or [`Layer::initialize_params_from_weight_map`]
/// runs per layer lifetime; a second initialization, `apply` before initialization, and any
/// call after [`Layer::dispose`] fail with [`LayerError::InvalidState`].
pub trait Layer<B: TensorBackend + 'static> {
    fn name(&self) -> &str;

    fn state(&self) -> LayerState;

    /// Shapes of every owned parameter.
    ///
    /// The order is the flat-stream contract: [`Layer::initialize_params`] takes values for these
    /// shapes in exactly this sequence, so changing it breaks every existing weight file.
    fn param_shapes(&self) -> Vec<Shape>;

    /// Total number of scalars the flat stream must supply for this layer.
    fn param_count(&self) -> usize {
        self.param_shapes().iter().map(Shape::num_elements).sum()
    }

    /// Populates parameters from a sequential stream, consuming exactly [`Layer::param_count`]
    /// values.
    fn initialize_params(&mut self, source: &mut dyn ExtractWeights) -> Result<()>;

    /// Populates parameters by looking up `<name>/<leaf>` paths.
    fn initialize_params_from_weight_map(&mut self, weights: &WeightMap) -> Result<()>;

    /// Releases every owned tensor, including those of nested components.
    fn dispose(&mut self) -> Result<()>;

    /// Pure forward pass; intermediates are released before returning.
    fn apply(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>>;

    /// Fully-qualified path of a parameter owned by this layer.
    fn with_name_path(&self, leaf: &str) -> Result<String> {
        params::with_name_path(self.name(), leaf)
    }
}

/// Parameter slot enforcing the `Uninitialized -> Ready -> Disposed` transitions.
pub(crate) enum LayerParams<P> {
    Uninitialized,
    Ready(P),
    Disposed,
}

impl<P> LayerParams<P> {
    pub(crate) fn state(&self) -> LayerState {
        match self {
            LayerParams::Uninitialized => LayerState::Uninitialized,
            LayerParams::Ready(_) => LayerState::Ready,
            LayerParams::Disposed => LayerState::Disposed,
        }
    }

    fn invalid(&self, layer: &str, operation: &'static str) -> LayerError {
        LayerError::InvalidState {
            layer: layer.to_string(),
            state: self.state(),
            operation,
        }
    }

    pub(crate) fn expect_uninitialized(&self, layer: &str, operation: &'static str) -> Result<()> {
        match self {
            LayerParams::Uninitialized => Ok(()),
            _ => Err(self.invalid(layer, operation)),
        }
    }

    pub(crate) fn ready(&self, layer: &str, operation: &'static str) -> Result<&P> {
        match self {
            LayerParams::Ready(params) => Ok(params),
            _ => Err(self.invalid(layer, operation)),
        }
    }

    pub(crate) fn set_ready(&mut self, params: P) {
        debug_assert!(matches!(self, LayerParams::Uninitialized));
        *self = LayerParams::Ready(params);
    }

    /// Moves the parameters out for release, leaving the slot disposed.
    pub(crate) fn take_ready(&mut self, layer: &str, operation: &'static str) -> Result<P> {
        if !matches!(self, LayerParams::Ready(_)) {
            return Err(self.invalid(layer, operation));
        }
        match std::mem::replace(self, LayerParams::Disposed) {
            LayerParams::Ready(params) => Ok(params),
            _ => unreachable!("state checked above"),
        }
    }
}
