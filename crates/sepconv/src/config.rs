//! Serializable layer configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};

use crate::error::{LayerError, Result};

fn default_epsilon() -> f32 {
    1e-3
}

fn default_true() -> bool {
    true
}

/// Batch-normalization options; its presence selects BatchNorm over Bias post-processing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchNormConfig {
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    /// Whether a learned per-channel `scale` parameter exists.
    #[serde(default = "default_true")]
    pub scale: bool,
    /// Whether a learned per-channel `offset` parameter exists.
    #[serde(default = "default_true")]
    pub offset: bool,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
            scale: true,
            offset: true,
        }
    }
}

impl BatchNormConfig {
    pub fn validate(&self, layer: &str) -> Result<()> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(LayerError::configuration(
                layer,
                format!("batch norm epsilon must be finite and > 0, got {}", self.epsilon),
            ));
        }
        Ok(())
    }
}

/// Structural hyperparameters of a [`DepthwiseSeparableConv`](crate::DepthwiseSeparableConv).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparableConvConfig {
    pub name: String,
    #[serde(default = "default_stride")]
    pub stride: [usize; 2],
    pub channels_in: usize,
    pub channels_out: usize,
    #[serde(default)]
    pub batch_norm: Option<BatchNormConfig>,
}

fn default_stride() -> [usize; 2] {
    [1, 1]
}

impl SeparableConvConfig {
    pub fn from_json_str(json: &str) -> AnyResult<Self> {
        serde_json::from_str(json).context("failed to parse separable conv config")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json_str(&json).with_context(|| format!("invalid config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct TempFile {
        path: PathBuf,
    }

    impl TempFile {
        fn new(prefix: &str) -> Self {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system time before unix epoch")
                .as_nanos();
            let mut path = std::env::temp_dir();
            path.push(format!("{prefix}_{}_{nanos}.json", std::process::id()));
            Self { path }
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    #[test]
    fn fills_defaults() {
        let config = SeparableConvConfig::from_json_str(
            r#"{"name": "block1", "channels_in": 2, "channels_out": 4}"#,
        )
        .unwrap();
        assert_eq!(config.stride, [1, 1]);
        assert_eq!(config.batch_norm, None);

        let config = SeparableConvConfig::from_json_str(
            r#"{"name": "b", "stride": [2, 1], "channels_in": 1, "channels_out": 1,
                "batch_norm": {"scale": false}}"#,
        )
        .unwrap();
        assert_eq!(config.stride, [2, 1]);
        let bn = config.batch_norm.unwrap();
        assert_eq!(bn.epsilon, 1e-3);
        assert!(!bn.scale);
        assert!(bn.offset);
    }

    #[test]
    fn rejects_bad_epsilon() {
        let config = BatchNormConfig {
            epsilon: 0.0,
            ..BatchNormConfig::default()
        };
        assert!(matches!(
            config.validate("block1"),
            Err(LayerError::Configuration { .. })
        ));
        let config = BatchNormConfig {
            epsilon: f32::NAN,
            ..BatchNormConfig::default()
        };
        assert!(config.validate("block1").is_err());
    }

    #[test]
    fn reports_missing_fields() {
        let err = SeparableConvConfig::from_json_str(r#"{"name": "x"}"#).unwrap_err();
        assert!(format!("{err:#}").contains("channels_in"));
    }

    #[test]
    fn loads_config_from_file() {
        let file = TempFile::new("sepconv_config");
        fs::write(
            &file.path,
            r#"{"name": "block7", "stride": [2, 2], "channels_in": 16, "channels_out": 32,
                "batch_norm": {"epsilon": 1e-5, "offset": false}}"#,
        )
        .unwrap();

        let config = SeparableConvConfig::from_json_file(&file.path).unwrap();
        assert_eq!(config.name, "block7");
        assert_eq!(config.stride, [2, 2]);
        assert_eq!(config.channels_out, 32);
        let bn = config.batch_norm.unwrap();
        assert_eq!(bn.epsilon, 1e-5);
        assert!(bn.scale);
        assert!(!bn.offset);
    }

    #[test]
    fn missing_file_names_the_path() {
        let file = TempFile::new("sepconv_missing");
        let err = SeparableConvConfig::from_json_file(&file.path).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("failed to read config"), "{message}");
        assert!(message.contains(&file.path.display().to_string()), "{message}");
    }

    #[test]
    fn malformed_file_reports_parse_context() {
        let file = TempFile::new("sepconv_malformed");
        fs::write(&file.path, "{\"name\": ").unwrap();
        let err = SeparableConvConfig::from_json_file(&file.path).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.starts_with("invalid config"), "{message}");
        assert!(message.contains("failed to parse separable conv config"), "{message}");
    }
}
