//! Inference-mode batch normalization with frozen statistics.

use std::sync::Arc;

use super::{Layer, LayerParams, LayerState};
use crate::backend::TensorBackend;
use crate::config::BatchNormConfig;
use crate::error::{LayerError, Result};
use crate::ops::functional;
use crate::params::validate_scope;
use crate::tensor::{dispose_all, materialize_all, DeviceTensor, Shape, Tensor};
use crate::weights::{extract_weight_tensor, extract_weight_values, ExtractWeights, WeightMap};

struct BatchNormParams<B: TensorBackend + 'static> {
    mean: DeviceTensor<B>,
    variance: DeviceTensor<B>,
    scale: Option<DeviceTensor<B>>,
    offset: Option<DeviceTensor<B>>,
}

impl<B: TensorBackend + 'static> BatchNormParams<B> {
    fn from_uploaded(config: &BatchNormConfig, uploaded: Vec<DeviceTensor<B>>) -> Result<Self> {
        let mut uploaded = uploaded.into_iter();
        let mut next = |leaf: &str| {
            uploaded.next().ok_or_else(|| {
                LayerError::InvalidInput(format!("batch norm upload is missing '{leaf}'"))
            })
        };
        let mean = next("mean")?;
        let variance = next("variance")?;
        let scale = if config.scale { Some(next("scale")?) } else { None };
        let offset = if config.offset {
            Some(next("offset")?)
        } else {
            None
        };
        Ok(Self {
            mean,
            variance,
            scale,
            offset,
        })
    }

    fn into_tensors(self) -> Vec<DeviceTensor<B>> {
        let mut tensors = vec![self.mean, self.variance];
        tensors.extend(self.scale);
        tensors.extend(self.offset);
        tensors
    }
}

/// Normalizes the innermost axis as `(x - mean) / sqrt(variance + epsilon) * scale + offset`.
///
/// Parameters (flat order): `mean`, `variance`, then `scale` and `offset` when enabled by the
/// [`BatchNormConfig`], each `[channels]`.
pub struct BatchNorm<B: TensorBackend + 'static> {
    backend: Arc<B>,
    name: String,
    channels: usize,
    config: BatchNormConfig,
    params: LayerParams<BatchNormParams<B>>,
}

impl<B: TensorBackend + 'static> BatchNorm<B> {
    pub fn new(
        backend: Arc<B>,
        name: impl Into<String>,
        channels: usize,
        config: BatchNormConfig,
    ) -> Result<Self> {
        let name = name.into();
        validate_scope(&name)?;
        if channels == 0 {
            return Err(LayerError::configuration(
                &name,
                "batch norm channels must be > 0",
            ));
        }
        config.validate(&name)?;
        Ok(Self {
            backend,
            name,
            channels,
            config,
            params: LayerParams::Uninitialized,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn config(&self) -> &BatchNormConfig {
        &self.config
    }

    /// Leaf names of the owned parameters, in flat-stream order.
    pub fn param_leaves(&self) -> Vec<&'static str> {
        let mut leaves = vec!["mean", "variance"];
        if self.config.scale {
            leaves.push("scale");
        }
        if self.config.offset {
            leaves.push("offset");
        }
        leaves
    }

    fn install(&mut self, hosts: &[Tensor]) -> Result<()> {
        let uploaded = materialize_all(&self.backend, hosts)?;
        let params = BatchNormParams::from_uploaded(&self.config, uploaded)?;
        self.params.set_ready(params);
        log::debug!(
            "{}: initialized batch norm over {} channels ({:?})",
            self.name,
            self.channels,
            self.param_leaves()
        );
        Ok(())
    }
}

impl<B: TensorBackend + 'static> Layer<B> for BatchNorm<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LayerState {
        self.params.state()
    }

    fn param_shapes(&self) -> Vec<Shape> {
        self.param_leaves()
            .iter()
            .map(|_| Shape::new([self.channels]))
            .collect()
    }

    fn initialize_params(&mut self, source: &mut dyn ExtractWeights) -> Result<()> {
        self.params.expect_uninitialized(&self.name, "initialize")?;
        let hosts = self
            .param_shapes()
            .iter()
            .map(|shape| extract_weight_values(source, shape))
            .collect::<Result<Vec<_>>>()?;
        self.install(&hosts)
    }

    fn initialize_params_from_weight_map(&mut self, weights: &WeightMap) -> Result<()> {
        self.params.expect_uninitialized(&self.name, "initialize")?;
        let shape = Shape::new([self.channels]);
        let hosts = self
            .param_leaves()
            .into_iter()
            .map(|leaf| {
                let path = self.with_name_path(leaf)?;
                extract_weight_tensor(weights, &path, &shape).cloned()
            })
            .collect::<Result<Vec<_>>>()?;
        self.install(&hosts)
    }

    fn dispose(&mut self) -> Result<()> {
        let params = self.params.take_ready(&self.name, "dispose")?;
        log::debug!("{}: disposing batch norm", self.name);
        dispose_all(&self.name, params.into_tensors())
    }

    fn apply(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let params = self.params.ready(&self.name, "apply")?;
        functional::batch_norm(
            x,
            &params.mean,
            &params.variance,
            params.scale.as_ref(),
            params.offset.as_ref(),
            self.config.epsilon,
        )
    }
}
