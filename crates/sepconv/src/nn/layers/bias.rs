//! Per-channel additive bias.

use std::sync::Arc;

use super::{Layer, LayerParams, LayerState};
use crate::backend::TensorBackend;
use crate::error::{LayerError, Result};
use crate::ops::functional;
use crate::params::validate_scope;
use crate::tensor::{dispose_all, DeviceTensor, Shape, Tensor};
use crate::weights::{extract_weight_tensor, extract_weight_values, ExtractWeights, WeightMap};

/// Adds a learned `[channels]` vector to the innermost axis.
///
/// Parameters (flat order): `bias [channels]`.
pub struct Bias<B: TensorBackend + 'static> {
    backend: Arc<B>,
    name: String,
    channels: usize,
    params: LayerParams<DeviceTensor<B>>,
}

impl<B: TensorBackend + 'static> Bias<B> {
    pub fn new(backend: Arc<B>, name: impl Into<String>, channels: usize) -> Result<Self> {
        let name = name.into();
        validate_scope(&name)?;
        if channels == 0 {
            return Err(LayerError::configuration(&name, "bias channels must be > 0"));
        }
        Ok(Self {
            backend,
            name,
            channels,
            params: LayerParams::Uninitialized,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    fn bias_shape(&self) -> Shape {
        Shape::new([self.channels])
    }

    fn install(&mut self, host: &Tensor) -> Result<()> {
        let bias = DeviceTensor::from_host(Arc::clone(&self.backend), host)?;
        self.params.set_ready(bias);
        log::debug!("{}: initialized bias {}", self.name, self.bias_shape());
        Ok(())
    }
}

impl<B: TensorBackend + 'static> Layer<B> for Bias<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LayerState {
        self.params.state()
    }

    fn param_shapes(&self) -> Vec<Shape> {
        vec![self.bias_shape()]
    }

    fn initialize_params(&mut self, source: &mut dyn ExtractWeights) -> Result<()> {
        self.params.expect_uninitialized(&self.name, "initialize")?;
        let host = extract_weight_values(source, &self.bias_shape())?;
        self.install(&host)
    }

    fn initialize_params_from_weight_map(&mut self, weights: &WeightMap) -> Result<()> {
        self.params.expect_uninitialized(&self.name, "initialize")?;
        let path = self.with_name_path("bias")?;
        let host = extract_weight_tensor(weights, &path, &self.bias_shape())?;
        self.install(host)
    }

    fn dispose(&mut self) -> Result<()> {
        let bias = self.params.take_ready(&self.name, "dispose")?;
        log::debug!("{}: disposing bias", self.name);
        dispose_all(&self.name, [bias])
    }

    fn apply(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let bias = self.params.ready(&self.name, "apply")?;
        functional::bias_add(x, bias)
    }
}
