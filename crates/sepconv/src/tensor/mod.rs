//! Core tensor abstractions shared between layers and backends.
//!
//! [`Tensor`] is the host-side value used for weights and literals, [`DeviceTensor`] wraps a
//! backend handle that must be released explicitly.

mod device_tensor;
mod host_tensor;
pub mod shape;

pub use device_tensor::DeviceTensor;
pub(crate) use device_tensor::{dispose_all, materialize_all};
pub use host_tensor::Tensor;
pub use shape::Shape;
