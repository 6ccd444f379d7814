//! Shape-checked functional wrappers around backend kernels.
//!
//! Each function validates operand shapes, resolves padding and output dimensions into a static
//! backend spec, and wraps the resulting handle in a fresh [`DeviceTensor`](crate::DeviceTensor)
//! owned by the caller.

mod conv;
mod normalization;

pub use conv::separable_conv2d;
pub use normalization::{batch_norm, bias_add};
