//! Weight sources used to populate layer parameters.
//!
//! Two sources exist and a layer consumes exactly one of them:
//!
//! - a flat sequential stream ([`ExtractWeights`]) consumed in the order declared by
//!   [`Layer::param_shapes`](crate::Layer::param_shapes), shared across all layers of a model so
//!   that whatever one layer leaves unread belongs to the next;
//! - a named map ([`WeightMap`]) keyed by fully-qualified parameter path.

use std::collections::HashMap;

use crate::error::{LayerError, Result};
use crate::tensor::{Shape, Tensor};

/// Named weight bundle keyed by `<scope>/<leaf>` paths.
pub type WeightMap = HashMap<String, Tensor>;

/// Sequential numeric supplier.
pub trait ExtractWeights {
    /// Returns exactly `count` values, or fails without consuming anything.
    fn take(&mut self, count: usize) -> Result<Vec<f32>>;
}

impl<F> ExtractWeights for F
where
    F: FnMut(usize) -> Result<Vec<f32>>,
{
    fn take(&mut self, count: usize) -> Result<Vec<f32>> {
        self(count)
    }
}

/// In-memory flat weight stream with a read cursor.
#[derive(Debug, Clone, Default)]
pub struct FlatWeights {
    values: Vec<f32>,
    cursor: usize,
}

impl FlatWeights {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, cursor: 0 }
    }

    /// Decodes a raw little-endian `f32` blob.
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(LayerError::InvalidInput(format!(
                "weight blob length {} is not a multiple of 4 bytes",
                bytes.len()
            )));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Ok(Self::new(values))
    }

    /// Number of values not yet consumed.
    pub fn remaining(&self) -> usize {
        self.values.len() - self.cursor
    }

    /// Number of values consumed so far.
    pub fn consumed(&self) -> usize {
        self.cursor
    }
}

impl ExtractWeights for FlatWeights {
    fn take(&mut self, count: usize) -> Result<Vec<f32>> {
        let available = self.remaining();
        if count > available {
            return Err(LayerError::WeightCountMismatch {
                requested: count,
                available,
            });
        }
        let start = self.cursor;
        self.cursor += count;
        Ok(self.values[start..self.cursor].to_vec())
    }
}

/// Pulls exactly `shape.num_elements()` values from `source` and shapes them.
pub(crate) fn extract_weight_values(
    source: &mut dyn ExtractWeights,
    shape: &Shape,
) -> Result<Tensor> {
    let requested = shape.num_elements();
    let values = source.take(requested)?;
    if values.len() != requested {
        return Err(LayerError::WeightCountMismatch {
            requested,
            available: values.len(),
        });
    }
    if crate::env::check_finite_enabled() {
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(LayerError::configuration(
                "weights",
                format!("non-finite value {} at offset {index} of {shape}", values[index]),
            ));
        }
    }
    Tensor::from_vec(shape.clone(), values)
}

/// Looks up `path` and checks that the stored tensor has exactly `expected` shape.
pub fn extract_weight_tensor<'a>(
    weights: &'a WeightMap,
    path: &str,
    expected: &Shape,
) -> Result<&'a Tensor> {
    let tensor = weights
        .get(path)
        .ok_or_else(|| LayerError::MissingParameter {
            path: path.to_string(),
        })?;
    if tensor.shape() != expected {
        return Err(LayerError::ShapeMismatch {
            path: path.to_string(),
            expected: expected.dims().to_vec(),
            actual: tensor.shape().dims().to_vec(),
        });
    }
    Ok(tensor)
}
