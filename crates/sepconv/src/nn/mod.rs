//! Neural network layers built on the functional backend ops.
//!
//! Layers follow a fixed lifecycle: construct with structural hyperparameters, populate once
//! from a weight source, apply any number of times, then dispose.

pub mod layers;

pub use layers::*;
