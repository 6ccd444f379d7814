//! Tensor operations layered over [`TensorBackend`](crate::backend::TensorBackend).

pub mod functional;
