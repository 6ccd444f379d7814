use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{ensure, Result};
use sepconv::backend::{
    BackendError, BackendResult, BatchNormSpec, ChannelwiseSpec, SeparableConv2dSpec,
    TensorBackend,
};
use sepconv::{
    BatchNormConfig, DepthwiseSeparableConv, DeviceTensor, FlatWeights, Layer, LayerError,
    LayerState, Shape, Tensor,
};
use sepconv_backend_ref_cpu::{CpuBackend, CpuTensor};

/// Wraps the CPU backend, recording every handle id it hands out and takes back.
struct TrackingBackend {
    inner: CpuBackend,
    issued: Mutex<Vec<u64>>,
    released: Mutex<Vec<u64>>,
    fail_materialize_at: Option<usize>,
    materialize_calls: AtomicUsize,
    fail_release_at: Option<usize>,
    release_calls: AtomicUsize,
}

impl TrackingBackend {
    fn new() -> Self {
        Self {
            inner: CpuBackend::new(),
            issued: Mutex::new(Vec::new()),
            released: Mutex::new(Vec::new()),
            fail_materialize_at: None,
            materialize_calls: AtomicUsize::new(0),
            fail_release_at: None,
            release_calls: AtomicUsize::new(0),
        }
    }

    /// Fails the `call`-th materialization (zero-based).
    fn failing_materialize_at(call: usize) -> Self {
        Self {
            fail_materialize_at: Some(call),
            ..Self::new()
        }
    }

    /// Reports the `call`-th release (zero-based) as failed after the memory is freed.
    fn failing_release_at(call: usize) -> Self {
        Self {
            fail_release_at: Some(call),
            ..Self::new()
        }
    }

    fn track(&self, handle: BackendResult<CpuTensor>) -> BackendResult<CpuTensor> {
        if let Ok(handle) = &handle {
            self.issued.lock().unwrap().push(handle.id());
        }
        handle
    }

    fn issued(&self) -> Vec<u64> {
        self.issued.lock().unwrap().clone()
    }

    fn released(&self) -> Vec<u64> {
        self.released.lock().unwrap().clone()
    }

    fn live_tensors(&self) -> usize {
        self.inner.live_tensors()
    }

    /// Every issued handle was released exactly once.
    fn check_balanced(&self) -> Result<()> {
        let released = self.released();
        let unique: HashSet<u64> = released.iter().copied().collect();
        ensure!(unique.len() == released.len(), "double release in {released:?}");
        let issued: HashSet<u64> = self.issued().into_iter().collect();
        ensure!(issued == unique, "issued {issued:?} but released {unique:?}");
        ensure!(self.live_tensors() == 0, "{} tensors leaked", self.live_tensors());
        Ok(())
    }
}

impl TensorBackend for TrackingBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu-tracking"
    }

    fn materialize(&self, tensor: &Tensor) -> BackendResult<CpuTensor> {
        let call = self.materialize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_materialize_at == Some(call) {
            return Err(BackendError::execution("injected materialize failure"));
        }
        self.track(self.inner.materialize(tensor))
    }

    fn to_host(&self, tensor: &CpuTensor) -> BackendResult<Tensor> {
        self.inner.to_host(tensor)
    }

    fn separable_conv2d(
        &self,
        input: &CpuTensor,
        depthwise: &CpuTensor,
        pointwise: &CpuTensor,
        spec: &SeparableConv2dSpec,
    ) -> BackendResult<CpuTensor> {
        self.track(self.inner.separable_conv2d(input, depthwise, pointwise, spec))
    }

    fn bias_add(
        &self,
        input: &CpuTensor,
        bias: &CpuTensor,
        spec: &ChannelwiseSpec,
    ) -> BackendResult<CpuTensor> {
        self.track(self.inner.bias_add(input, bias, spec))
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
        self.track(self.inner.batch_norm(input, mean, variance, scale, offset, spec))
    }

    fn release(&self, tensor: CpuTensor) -> BackendResult<()> {
        let call = self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.released.lock().unwrap().push(tensor.id());
        self.inner.release(tensor)?;
        if self.fail_release_at == Some(call) {
            return Err(BackendError::execution("injected release failure"));
        }
        Ok(())
    }
}

fn init_ones<B: TensorBackend + 'static>(layer: &mut DepthwiseSeparableConv<B>) -> Result<()> {
    let values = vec![1.0; layer.param_count()];
    layer.initialize_params(&mut FlatWeights::new(values))?;
    Ok(())
}

fn ones_input<B: TensorBackend + 'static>(
    backend: &Arc<B>,
    dims: [usize; 4],
) -> Result<DeviceTensor<B>> {
    Ok(DeviceTensor::from_host(
        Arc::clone(backend),
        &Tensor::ones(Shape::new(dims)),
    )?)
}

fn invalid_state(err: LayerError) -> Option<(LayerState, &'static str)> {
    match err {
        LayerError::InvalidState {
            state, operation, ..
        } => Some((state, operation)),
        _ => None,
    }
}

#[test]
fn apply_before_initialization_is_rejected() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let layer =
        DepthwiseSeparableConv::new(Arc::clone(&backend), "block1", [1, 1], 2, 4, None)?;
    let x = ones_input(&backend, [1, 4, 4, 2])?;

    let err = layer.apply(&x).unwrap_err();
    assert_eq!(invalid_state(err), Some((LayerState::Uninitialized, "apply")));
    x.dispose()?;
    Ok(())
}

#[test]
fn second_initialization_is_rejected() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let mut layer =
        DepthwiseSeparableConv::new(Arc::clone(&backend), "block1", [1, 1], 2, 4, None)?;
    init_ones(&mut layer)?;
    let live = backend.live_tensors();

    let mut source = FlatWeights::new(vec![0.0; layer.param_count()]);
    let err = layer.initialize_params(&mut source).unwrap_err();
    assert_eq!(invalid_state(err), Some((LayerState::Ready, "initialize")));
    // Nothing was read or uploaded.
    assert_eq!(source.consumed(), 0);
    assert_eq!(backend.live_tensors(), live);

    layer.dispose()?;
    Ok(())
}

#[test]
fn disposed_layer_rejects_every_operation() -> Result<()> {
    let backend = Arc::new(CpuBackend::new());
    let mut layer =
        DepthwiseSeparableConv::new(Arc::clone(&backend), "block1", [1, 1], 2, 4, None)?;
    init_ones(&mut layer)?;
    layer.dispose()?;
    assert_eq!(layer.state(), LayerState::Disposed);
    assert_eq!(layer.post_processor().state(), LayerState::Disposed);

    let x = ones_input(&backend, [1, 4, 4, 2])?;
    let err = layer.apply(&x).unwrap_err();
    assert_eq!(invalid_state(err), Some((LayerState::Disposed, "apply")));

    let err = layer.dispose().unwrap_err();
    assert_eq!(invalid_state(err), Some((LayerState::Disposed, "dispose")));

    let err = layer
        .initialize_params(&mut FlatWeights::new(vec![1.0; 30]))
        .unwrap_err();
    assert_eq!(invalid_state(err), Some((LayerState::Disposed, "initialize")));

    x.dispose()?;
    assert_eq!(backend.live_tensors(), 0);
    Ok(())
}

#[test]
fn dispose_releases_every_owned_tensor_once() -> Result<()> {
    for batch_norm in [None, Some(BatchNormConfig::default())] {
        let backend = Arc::new(TrackingBackend::new());
        let mut layer = DepthwiseSeparableConv::new(
            Arc::clone(&backend),
            "block1",
            [1, 1],
            2,
            4,
            batch_norm,
        )?;
        init_ones(&mut layer)?;
        let owned = layer.param_shapes().len();
        assert_eq!(backend.issued().len(), owned);

        layer.dispose()?;
        assert_eq!(backend.released().len(), owned);
        backend.check_balanced()?;
    }
    Ok(())
}

#[test]
fn apply_releases_intermediates() -> Result<()> {
    let backend = Arc::new(TrackingBackend::new());
    let config = BatchNormConfig::default();
    let mut layer =
        DepthwiseSeparableConv::new(Arc::clone(&backend), "block1", [2, 2], 2, 4, Some(config))?;
    init_ones(&mut layer)?;
    let x = ones_input(&backend, [1, 6, 6, 2])?;
    let before = backend.live_tensors();

    let y = layer.apply(&x)?;
    // Only the output survives the call.
    assert_eq!(backend.live_tensors(), before + 1);
    assert_eq!(y.shape().dims(), &[1, 3, 3, 4]);

    y.dispose()?;
    x.dispose()?;
    layer.dispose()?;
    backend.check_balanced()?;
    Ok(())
}

#[test]
fn failed_post_processor_upload_rolls_back_filters() -> Result<()> {
    // Calls 0 and 1 upload the filters, call 2 is the bias.
    let backend = Arc::new(TrackingBackend::failing_materialize_at(2));
    let mut layer =
        DepthwiseSeparableConv::new(Arc::clone(&backend), "block1", [1, 1], 2, 4, None)?;

    let err = init_ones(&mut layer).unwrap_err();
    assert!(err.to_string().contains("injected materialize failure"));
    assert_eq!(layer.state(), LayerState::Uninitialized);
    assert_eq!(layer.post_processor().state(), LayerState::Uninitialized);
    assert_eq!(backend.issued().len(), 2);
    backend.check_balanced()?;

    // The injected failure was one-shot; a fresh attempt succeeds.
    init_ones(&mut layer)?;
    assert_eq!(layer.state(), LayerState::Ready);
    layer.dispose()?;
    backend.check_balanced()?;
    Ok(())
}

#[test]
fn failed_batch_norm_upload_releases_partial_statistics() -> Result<()> {
    // Filters at 0 and 1, mean at 2, variance at 3 fails.
    let backend = Arc::new(TrackingBackend::failing_materialize_at(3));
    let mut layer = DepthwiseSeparableConv::new(
        Arc::clone(&backend),
        "block1",
        [1, 1],
        2,
        4,
        Some(BatchNormConfig::default()),
    )?;
    assert!(init_ones(&mut layer).is_err());
    assert_eq!(layer.state(), LayerState::Uninitialized);
    assert_eq!(backend.issued().len(), 3);
    backend.check_balanced()?;
    Ok(())
}

#[test]
fn dispose_keeps_releasing_after_a_failure() -> Result<()> {
    // Releases run depthwise, pointwise, then bias.
    for failing in 0..3 {
        let backend = Arc::new(TrackingBackend::failing_release_at(failing));
        let mut layer =
            DepthwiseSeparableConv::new(Arc::clone(&backend), "block1", [1, 1], 2, 4, None)?;
        init_ones(&mut layer)?;

        let err = layer.dispose().unwrap_err();
        assert!(err.to_string().contains("injected release failure"));
        assert_eq!(backend.released().len(), 3, "failing release {failing}");
        assert_eq!(layer.state(), LayerState::Disposed);
        assert_eq!(layer.post_processor().state(), LayerState::Disposed);
        backend.check_balanced()?;
    }
    Ok(())
}

#[test]
fn apply_reports_failed_intermediate_release_without_leaking() -> Result<()> {
    // No release happens before apply, so the first one is the conv intermediate.
    let backend = Arc::new(TrackingBackend::failing_release_at(0));
    let mut layer =
        DepthwiseSeparableConv::new(Arc::clone(&backend), "block1", [1, 1], 2, 4, None)?;
    init_ones(&mut layer)?;
    let x = ones_input(&backend, [1, 4, 4, 2])?;
    let before = backend.live_tensors();

    let err = layer.apply(&x).unwrap_err();
    assert!(err.to_string().contains("injected release failure"));
    // Both the intermediate and the finished output were handed back.
    assert_eq!(backend.live_tensors(), before);
    assert_eq!(backend.released().len(), 2);

    x.dispose()?;
    layer.dispose()?;
    backend.check_balanced()?;
    Ok(())
}
