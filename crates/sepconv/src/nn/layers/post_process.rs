//! Post-processing step applied after a convolution: either a bias or a batch norm.

use std::sync::Arc;

use super::{BatchNorm, Bias, Layer, LayerState};
use crate::backend::TensorBackend;
use crate::config::BatchNormConfig;
use crate::error::Result;
use crate::params::with_name_path;
use crate::tensor::{DeviceTensor, Shape};
use crate::weights::{ExtractWeights, WeightMap};

/// Exactly one post-processing variant, fixed when the owning layer is constructed.
pub enum PostProcessor<B: TensorBackend + 'static> {
    Bias(Bias<B>),
    BatchNorm(BatchNorm<B>),
}

impl<B: TensorBackend + 'static> PostProcessor<B> {
    /// Picks BatchNorm when a config is supplied, otherwise Bias, scoped under `owner`.
    pub fn for_channels(
        backend: Arc<B>,
        owner: &str,
        channels: usize,
        batch_norm: Option<BatchNormConfig>,
    ) -> Result<Self> {
        match batch_norm {
            Some(config) => {
                let scope = with_name_path(owner, "batch_norm")?;
                Ok(PostProcessor::BatchNorm(BatchNorm::new(
                    backend, scope, channels, config,
                )?))
            }
            None => {
                let scope = with_name_path(owner, "bias")?;
                Ok(PostProcessor::Bias(Bias::new(backend, scope, channels)?))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PostProcessor::Bias(_) => "bias",
            PostProcessor::BatchNorm(_) => "batch_norm",
        }
    }

    fn as_layer(&self) -> &dyn Layer<B> {
        match self {
            PostProcessor::Bias(bias) => bias,
            PostProcessor::BatchNorm(bn) => bn,
        }
    }

    fn as_layer_mut(&mut self) -> &mut dyn Layer<B> {
        match self {
            PostProcessor::Bias(bias) => bias,
            PostProcessor::BatchNorm(bn) => bn,
        }
    }
}

impl<B: TensorBackend + 'static> Layer<B> for PostProcessor<B> {
    fn name(&self) -> &str {
        self.as_layer().name()
    }

    fn state(&self) -> LayerState {
        self.as_layer().state()
    }

    fn param_shapes(&self) -> Vec<Shape> {
        self.as_layer().param_shapes()
    }

    fn initialize_params(&mut self, source: &mut dyn ExtractWeights) -> Result<()> {
        self.as_layer_mut().initialize_params(source)
    }

    fn initialize_params_from_weight_map(&mut self, weights: &WeightMap) -> Result<()> {
        self.as_layer_mut().initialize_params_from_weight_map(weights)
    }

    fn dispose(&mut self) -> Result<()> {
        self.as_layer_mut().dispose()
    }

    fn apply(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        self.as_layer().apply(x)
    }
}
