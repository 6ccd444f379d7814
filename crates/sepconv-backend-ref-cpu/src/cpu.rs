use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use sepconv::backend::{
    BackendError, BackendResult, BatchNormSpec, ChannelwiseSpec, SeparableConv2dSpec,
    TensorBackend,
};
use sepconv::{Shape, Tensor};

/// Host-memory tensor handle. Each handle carries a unique id for allocation tracking.
#[derive(Debug)]
pub struct CpuTensor {
    id: u64,
    dims: Vec<usize>,
    data: Vec<f32>,
}

impl CpuTensor {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Reference backend running naive f32 kernels on the host.
///
/// Tracks how many handles are currently live so callers can assert that every tensor handed
/// out was released.
#[derive(Debug, Default)]
pub struct CpuBackend {
    next_id: AtomicU64,
    live: AtomicUsize,
    allocated: AtomicUsize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles allocated and not yet released.
    pub fn live_tensors(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Handles allocated over the backend's lifetime.
    pub fn allocated_tensors(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    fn alloc(&self, dims: Vec<usize>, data: Vec<f32>) -> CpuTensor {
        self.live.fetch_add(1, Ordering::SeqCst);
        self.allocated.fetch_add(1, Ordering::SeqCst);
        CpuTensor {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            dims,
            data,
        }
    }
}

impl TensorBackend for CpuBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn materialize(&self, tensor: &Tensor) -> BackendResult<CpuTensor> {
        Ok(self.alloc(tensor.shape().dims().to_vec(), tensor.data().to_vec()))
    }

    fn to_host(&self, tensor: &CpuTensor) -> BackendResult<Tensor> {
        Tensor::from_vec(Shape::new(tensor.dims.clone()), tensor.data.clone())
            .map_err(|err| BackendError::execution(err.to_string()))
    }

    fn separable_conv2d(
        &self,
        input: &CpuTensor,
        depthwise: &CpuTensor,
        pointwise: &CpuTensor,
        spec: &SeparableConv2dSpec,
    ) -> BackendResult<CpuTensor> {
        let [n, h, w, c_in] = spec.input;
        let [_, out_h, out_w, c_out] = spec.output;
        let [k_h, k_w] = spec.kernel;
        let [s_h, s_w] = spec.stride;

        expect_dims("separable_conv2d input", input, &spec.input)?;
        expect_dims("separable_conv2d depthwise", depthwise, &[k_h, k_w, c_in, 1])?;
        expect_dims("separable_conv2d pointwise", pointwise, &[1, 1, c_in, c_out])?;
        if s_h == 0 || s_w == 0 {
            return Err(BackendError::execution(
                "separable_conv2d stride must be > 0",
            ));
        }

        log::trace!(
            "cpu separable_conv2d {:?} -> {:?}, padding {:?}",
            spec.input,
            spec.output,
            spec.padding
        );
        let depthwise_out = depthwise_conv(
            &input.data,
            &depthwise.data,
            [n, h, w, c_in],
            [out_h, out_w],
            spec,
        );

        let pixels = n * out_h * out_w;
        let mut result = vec![0.0f32; pixels * c_out];
        for p in 0..pixels {
            let src = &depthwise_out[p * c_in..(p + 1) * c_in];
            let dst = &mut result[p * c_out..(p + 1) * c_out];
            for (ci, &value) in src.iter().enumerate() {
                let row = &pointwise.data[ci * c_out..(ci + 1) * c_out];
                for (acc, &weight) in dst.iter_mut().zip(row) {
                    *acc += value * weight;
                }
            }
        }

        Ok(self.alloc(spec.output.to_vec(), result))
    }

    fn bias_add(
        &self,
        input: &CpuTensor,
        bias: &CpuTensor,
        spec: &ChannelwiseSpec,
    ) -> BackendResult<CpuTensor> {
        expect_dims("bias_add input", input, &spec.dims)?;
        let channels = spec.channels();
        expect_dims("bias_add bias", bias, &[channels])?;

        let mut result = input.data.clone();
        for row in result.chunks_exact_mut(channels) {
            for (value, &b) in row.iter_mut().zip(&bias.data) {
                *value += b;
            }
        }
        Ok(self.alloc(spec.dims.clone(), result))
    }

    fn batch_norm(
        &self,
        input: &CpuTensor,
        mean: &CpuTensor,
        variance: &CpuTensor,
        scale: Option<&CpuTensor>,
        offset: Option<&CpuTensor>,
        spec: &BatchNormSpec,
    ) -> BackendResult<CpuTensor> {
        expect_dims("batch_norm input", input, &spec.dims)?;
        let channels = spec.channels();
        expect_dims("batch_norm mean", mean, &[channels])?;
        expect_dims("batch_norm variance", variance, &[channels])?;
        if let Some(scale) = scale {
            expect_dims("batch_norm scale", scale, &[channels])?;
        }
        if let Some(offset) = offset {
            expect_dims("batch_norm offset", offset, &[channels])?;
        }

        // Fold the statistics into one multiplier and one shift per channel.
        let mut multiplier = Vec::with_capacity(channels);
        let mut shift = Vec::with_capacity(channels);
        for c in 0..channels {
            let inv_std = 1.0 / (variance.data[c] + spec.epsilon).sqrt();
            let gamma = scale.map_or(1.0, |s| s.data[c]);
            let beta = offset.map_or(0.0, |o| o.data[c]);
            multiplier.push(inv_std * gamma);
            shift.push(beta - mean.data[c] * inv_std * gamma);
        }

        let mut result = input.data.clone();
        for row in result.chunks_exact_mut(channels) {
            for ((value, &m), &s) in row.iter_mut().zip(&multiplier).zip(&shift) {
                *value = *value * m + s;
            }
        }
        Ok(self.alloc(spec.dims.clone(), result))
    }

    fn release(&self, tensor: CpuTensor) -> BackendResult<()> {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| live.checked_sub(1))
            .map_err(|_| {
                log::warn!("cpu release of tensor {} with no live allocations", tensor.id);
                BackendError::execution(format!(
                    "release of tensor {} with no live allocations",
                    tensor.id
                ))
            })?;
        Ok(())
    }
}

fn expect_dims(what: &str, tensor: &CpuTensor, dims: &[usize]) -> BackendResult<()> {
    if tensor.dims.as_slice() != dims {
        return Err(BackendError::execution(format!(
            "{what} shape mismatch: expected {dims:?}, got {:?}",
            tensor.dims
        )));
    }
    Ok(())
}

/// Per-channel 3D window sum over zero-padded NHWC input; returns `[N, out_h, out_w, C]`.
fn depthwise_conv(
    input: &[f32],
    filter: &[f32],
    [n, h, w, c]: [usize; 4],
    [out_h, out_w]: [usize; 2],
    spec: &SeparableConv2dSpec,
) -> Vec<f32> {
    let [k_h, k_w] = spec.kernel;
    let [s_h, s_w] = spec.stride;
    let pad_top = spec.padding.top as isize;
    let pad_left = spec.padding.left as isize;

    let mut result = vec![0.0f32; n * out_h * out_w * c];
    for n_idx in 0..n {
        for oh in 0..out_h {
            let base_h = oh as isize * s_h as isize - pad_top;
            for ow in 0..out_w {
                let base_w = ow as isize * s_w as isize - pad_left;
                let out_base = ((n_idx * out_h + oh) * out_w + ow) * c;
                let acc = &mut result[out_base..out_base + c];

                for kh in 0..k_h {
                    let in_h = base_h + kh as isize;
                    if in_h < 0 || in_h >= h as isize {
                        continue;
                    }
                    for kw in 0..k_w {
                        let in_w = base_w + kw as isize;
                        if in_w < 0 || in_w >= w as isize {
                            continue;
                        }
                        let in_offset = ((n_idx * h + in_h as usize) * w + in_w as usize) * c;
                        let filter_offset = (kh * k_w + kw) * c;
                        let pixel = &input[in_offset..in_offset + c];
                        let weights = &filter[filter_offset..filter_offset + c];
                        for ((a, &x), &wgt) in acc.iter_mut().zip(pixel).zip(weights) {
                            *a += x * wgt;
                        }
                    }
                }
            }
        }
    }
    result
}
