//! Error taxonomy shared by layers, weight sources, and functional ops.

use thiserror::Error;

use crate::backend::BackendError;
use crate::nn::LayerState;

#[derive(Debug, Error)]
pub enum LayerError {
    /// Structural hyperparameters or a batch-norm configuration are invalid.
    #[error("invalid configuration for '{layer}': {reason}")]
    Configuration { layer: String, reason: String },
    /// The flat weight source ran dry before the declared parameters were filled.
    #[error("weight source exhausted: requested {requested} values, {available} available")]
    WeightCountMismatch { requested: usize, available: usize },
    #[error("missing parameter '{path}' in weight map")]
    MissingParameter { path: String },
    #[error("shape mismatch for '{path}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        path: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("layer '{layer}' cannot {operation} while {state}")]
    InvalidState {
        layer: String,
        state: LayerState,
        operation: &'static str,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl LayerError {
    pub fn configuration(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        LayerError::Configuration {
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LayerError>;
