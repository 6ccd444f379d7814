//! Depthwise separable convolution: a 3x3 depthwise pass, a 1x1 pointwise pass, and a
//! bias or batch-norm post-processing step (NHWC layout).

use std::sync::Arc;

use super::{Layer, LayerParams, LayerState, PostProcessor};
use crate::backend::{PaddingMode, TensorBackend};
use crate::config::{BatchNormConfig, SeparableConvConfig};
use crate::error::{LayerError, Result};
use crate::ops::functional;
use crate::params::validate_scope;
use crate::tensor::{dispose_all, DeviceTensor, Shape, Tensor};
use crate::weights::{extract_weight_tensor, extract_weight_values, ExtractWeights, WeightMap};

const KERNEL: [usize; 2] = [3, 3];

struct SeparableFilters<B: TensorBackend + 'static> {
    depthwise: DeviceTensor<B>,
    pointwise: DeviceTensor<B>,
}

impl<B: TensorBackend + 'static> SeparableFilters<B> {
    fn into_tensors(self) -> [DeviceTensor<B>; 2] {
        [self.depthwise, self.pointwise]
    }
}

/// `post_process(pointwise(depthwise(x)))` with SAME padding.
///
/// Parameters (flat order):
/// 1. `depthwise_filter [3, 3, channels_in, 1]`
/// 2. `pointwise_filter [1, 1, channels_in, channels_out]`
/// 3. the post-processor's own parameters (`bias/bias`, or `batch_norm/{mean, variance, ...}`)
pub struct DepthwiseSeparableConv<B: TensorBackend + 'static> {
    backend: Arc<B>,
    name: String,
    stride: [usize; 2],
    channels_in: usize,
    channels_out: usize,
    post_processor: PostProcessor<B>,
    filters: LayerParams<SeparableFilters<B>>,
}

impl<B: TensorBackend + 'static> DepthwiseSeparableConv<B> {
    /// Builds an uninitialized layer; a `batch_norm` config selects BatchNorm post-processing,
    /// otherwise a Bias is used.
    pub fn new(
        backend: Arc<B>,
        name: impl Into<String>,
        stride: [usize; 2],
        channels_in: usize,
        channels_out: usize,
        batch_norm: Option<BatchNormConfig>,
    ) -> Result<Self> {
        let name = name.into();
        validate_scope(&name)?;
        if channels_in == 0 || channels_out == 0 {
            return Err(LayerError::configuration(
                &name,
                format!("channels must be > 0, got in={channels_in} out={channels_out}"),
            ));
        }
        if stride.contains(&0) {
            return Err(LayerError::configuration(
                &name,
                format!("stride must be > 0, got {stride:?}"),
            ));
        }
        let post_processor =
            PostProcessor::for_channels(Arc::clone(&backend), &name, channels_out, batch_norm)?;
        log::debug!(
            "{name}: separable conv {channels_in} -> {channels_out}, stride {stride:?}, {}",
            post_processor.kind()
        );
        Ok(Self {
            backend,
            name,
            stride,
            channels_in,
            channels_out,
            post_processor,
            filters: LayerParams::Uninitialized,
        })
    }

    pub fn from_config(backend: Arc<B>, config: &SeparableConvConfig) -> Result<Self> {
        Self::new(
            backend,
            config.name.clone(),
            config.stride,
            config.channels_in,
            config.channels_out,
            config.batch_norm,
        )
    }

    pub fn stride(&self) -> [usize; 2] {
        self.stride
    }

    pub fn channels_in(&self) -> usize {
        self.channels_in
    }

    pub fn channels_out(&self) -> usize {
        self.channels_out
    }

    pub fn post_processor(&self) -> &PostProcessor<B> {
        &self.post_processor
    }

    pub fn depthwise_filter_shape(&self) -> Shape {
        Shape::new([KERNEL[0], KERNEL[1], self.channels_in, 1])
    }

    pub fn pointwise_filter_shape(&self) -> Shape {
        Shape::new([1, 1, self.channels_in, self.channels_out])
    }

    /// Output shape for an NHWC `input`: `[N, ceil(H / sh), ceil(W / sw), channels_out]`.
    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        self.check_input(input)?;
        let dims = input.dims();
        Ok(Shape::new([
            dims[0],
            dims[1].div_ceil(self.stride[0]),
            dims[2].div_ceil(self.stride[1]),
            self.channels_out,
        ]))
    }

    fn check_input(&self, input: &Shape) -> Result<()> {
        if input.rank() != 4 || input.last_dim() != self.channels_in {
            return Err(LayerError::InvalidInput(format!(
                "{} expects NHWC input with {} channels, got {input}",
                self.name, self.channels_in
            )));
        }
        Ok(())
    }

    /// Uploads both filters, then lets the post-processor initialize itself; on failure nothing
    /// stays allocated and the layer remains uninitialized.
    fn install(
        &mut self,
        depthwise: &Tensor,
        pointwise: &Tensor,
        init_post: impl FnOnce(&mut PostProcessor<B>) -> Result<()>,
    ) -> Result<()> {
        let depthwise = DeviceTensor::from_host(Arc::clone(&self.backend), depthwise)?;
        let pointwise = match DeviceTensor::from_host(Arc::clone(&self.backend), pointwise) {
            Ok(pointwise) => pointwise,
            Err(err) => {
                let _ = dispose_all(&self.name, [depthwise]);
                return Err(err);
            }
        };
        let filters = SeparableFilters {
            depthwise,
            pointwise,
        };
        if let Err(err) = init_post(&mut self.post_processor) {
            log::debug!("{}: post-processor initialization failed: {err}", self.name);
            let _ = dispose_all(&self.name, filters.into_tensors());
            return Err(err);
        }
        self.filters.set_ready(filters);
        log::debug!(
            "{}: initialized filters {} and {}",
            self.name,
            self.depthwise_filter_shape(),
            self.pointwise_filter_shape()
        );
        Ok(())
    }
}

impl<B: TensorBackend + 'static> Layer<B> for DepthwiseSeparableConv<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LayerState {
        self.filters.state()
    }

    fn param_shapes(&self) -> Vec<Shape> {
        let mut shapes = vec![self.depthwise_filter_shape(), self.pointwise_filter_shape()];
        shapes.extend(self.post_processor.param_shapes());
        shapes
    }

    fn initialize_params(&mut self, source: &mut dyn ExtractWeights) -> Result<()> {
        self.filters.expect_uninitialized(&self.name, "initialize")?;
        let depthwise = extract_weight_values(source, &self.depthwise_filter_shape())?;
        let pointwise = extract_weight_values(source, &self.pointwise_filter_shape())?;
        self.install(&depthwise, &pointwise, |post| post.initialize_params(source))
    }

    fn initialize_params_from_weight_map(&mut self, weights: &WeightMap) -> Result<()> {
        self.filters.expect_uninitialized(&self.name, "initialize")?;
        let depthwise = extract_weight_tensor(
            weights,
            &self.with_name_path("depthwise_filter")?,
            &self.depthwise_filter_shape(),
        )?;
        let pointwise = extract_weight_tensor(
            weights,
            &self.with_name_path("pointwise_filter")?,
            &self.pointwise_filter_shape(),
        )?;
        self.install(depthwise, pointwise, |post| {
            post.initialize_params_from_weight_map(weights)
        })
    }

    fn dispose(&mut self) -> Result<()> {
        let filters = self.filters.take_ready(&self.name, "dispose")?;
        log::debug!("{}: disposing", self.name);
        let filters_released = dispose_all(&self.name, filters.into_tensors());
        let post_released = self.post_processor.dispose();
        filters_released.and(post_released)
    }

    fn apply(&self, x: &DeviceTensor<B>) -> Result<DeviceTensor<B>> {
        let filters = self.filters.ready(&self.name, "apply")?;
        self.check_input(x.shape())?;
        log::trace!("{}: apply {}", self.name, x.shape());

        let conv = functional::separable_conv2d(
            x,
            &filters.depthwise,
            &filters.pointwise,
            self.stride,
            PaddingMode::Same,
        )?;
        let output = self.post_processor.apply(&conv);
        let released = conv.dispose();
        match (output, released) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(output), Err(err)) => {
                let _ = dispose_all(&self.name, [output]);
                Err(err)
            }
            (Err(err), released) => {
                if let Err(release_err) = released {
                    log::warn!("{}: failed to release intermediate: {release_err}", self.name);
                }
                Err(err)
            }
        }
    }
}
