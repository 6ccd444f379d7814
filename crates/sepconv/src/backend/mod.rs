//! Tensor engine interface consumed by layers and functional ops.

pub mod shape_helpers;
pub mod spec;

pub use shape_helpers::PaddingMode;
pub use spec::{
    BackendError, BackendResult, BatchNormSpec, ChannelwiseSpec, Padding2d, SeparableConv2dSpec,
    TensorBackend,
};
