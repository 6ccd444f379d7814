//! Device-side tensor wrapper that owns a backend handle and its shape metadata.

use super::{shape::Shape, Tensor};
use crate::backend::TensorBackend;
use crate::error::{LayerError, Result};
use std::fmt;
use std::sync::Arc;

/// Exclusively owned backend tensor.
///
/// There is no `Clone`: every handle has exactly one owner, and the owner gives the memory back
/// by consuming the tensor through [`DeviceTensor::dispose`].
pub struct DeviceTensor<B: TensorBackend + 'static> {
    backend: Arc<B>,
    shape: Shape,
    handle: B::TensorHandle,
}

impl<B: TensorBackend + 'static> DeviceTensor<B> {
    /// Transfers a host tensor into backend memory, producing a fresh device tensor.
    pub fn from_host(backend: Arc<B>, tensor: &Tensor) -> Result<Self> {
        let handle = backend.materialize(tensor)?;
        Ok(DeviceTensor {
            backend,
            shape: tensor.shape().clone(),
            handle,
        })
    }

    /// Wraps a handle freshly produced by a backend operation.
    pub fn from_handle(backend: Arc<B>, shape: Shape, handle: B::TensorHandle) -> Self {
        DeviceTensor {
            backend,
            shape,
            handle,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn handle(&self) -> &B::TensorHandle {
        &self.handle
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Copies the tensor contents back to the host.
    pub fn to_host(&self) -> Result<Tensor> {
        let host = self.backend.to_host(&self.handle)?;
        if host.shape() != &self.shape {
            return Err(LayerError::InvalidInput(format!(
                "backend '{}' returned shape {} for a tensor of shape {}",
                self.backend.backend_name(),
                host.shape(),
                self.shape
            )));
        }
        Ok(host)
    }

    /// Releases the backend memory held by this tensor.
    pub fn dispose(self) -> Result<()> {
        self.backend.release(self.handle)?;
        Ok(())
    }
}

impl<B: TensorBackend + 'static> fmt::Debug for DeviceTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("backend", &self.backend.backend_name())
            .field("shape", &self.shape)
            .finish()
    }
}

/// Uploads a batch of host tensors, releasing the ones already uploaded if a later upload fails.
pub(crate) fn materialize_all<B: TensorBackend + 'static>(
    backend: &Arc<B>,
    tensors: &[Tensor],
) -> Result<Vec<DeviceTensor<B>>> {
    let mut uploaded = Vec::with_capacity(tensors.len());
    for tensor in tensors {
        match DeviceTensor::from_host(Arc::clone(backend), tensor) {
            Ok(device) => uploaded.push(device),
            Err(err) => {
                for device in uploaded {
                    if let Err(release_err) = device.dispose() {
                        log::warn!("failed to release tensor during rollback: {release_err}");
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(uploaded)
}

/// Releases every tensor even when some releases fail, reporting the first failure.
pub(crate) fn dispose_all<B: TensorBackend + 'static>(
    owner: &str,
    tensors: impl IntoIterator<Item = DeviceTensor<B>>,
) -> Result<()> {
    let mut first_error = None;
    for tensor in tensors {
        let shape = tensor.shape().clone();
        if let Err(err) = tensor.dispose() {
            log::warn!("{owner}: failed to release tensor of shape {shape}: {err}");
            first_error.get_or_insert(err);
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
