//! Depthwise separable convolution layer with explicit parameter lifecycles.
//!
//! Layers declare their parameter shapes up front, are populated exactly once from either a
//! flat weight stream or a named weight map, run inference through a pluggable
//! [`TensorBackend`], and release every backend tensor they own on [`Layer::dispose`].

pub mod backend;
pub mod config;
mod env;
pub mod error;
pub mod nn;
pub mod ops;
pub mod params;
pub mod tensor;
pub mod weights;

pub use backend::TensorBackend;
pub use config::{BatchNormConfig, SeparableConvConfig};
pub use error::{LayerError, Result};
pub use nn::{BatchNorm, Bias, DepthwiseSeparableConv, Layer, LayerState, PostProcessor};
pub use tensor::{DeviceTensor, Shape, Tensor};
pub use weights::{ExtractWeights, FlatWeights, WeightMap};
