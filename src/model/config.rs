// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Model configuration: chunk geometry, stride and supported batch shapes.
//!
//! Loaded once at startup (usually from TOML) and shared read-only by every
//! caller and runner through an `Arc`.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One supported `(batch_size, chunk_size)` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchDims {
    pub batch_size: usize,
    pub chunk_size: usize,
}

impl BatchDims {
    pub fn new(batch_size: usize, chunk_size: usize) -> Self {
        Self { batch_size, chunk_size }
    }
}

impl std::fmt::Display for BatchDims {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.batch_size, self.chunk_size)
    }
}

#[derive(Debug, Error)]
pub enum ModelConfigError {
    #[error("Failed to read model config {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse model config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid model config: {0}")]
    Invalid(String),
}

fn default_channels() -> usize {
    1
}

fn default_num_states() -> usize {
    5
}

fn default_batch_timeout_ms() -> u64 {
    100
}

/// Immutable model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Default chunk length in samples.
    pub chunk_size: usize,
    /// Downsampling factor between input samples and output steps.
    pub stride: usize,
    #[serde(default = "default_channels")]
    pub channels: usize,
    /// Output states per step (blank + bases).
    #[serde(default = "default_num_states")]
    pub num_states: usize,
    /// Additional batch shapes offered to runners. A `batch_size` of 0
    /// inherits the caller's primary batch size.
    #[serde(default)]
    pub batch_shapes: Vec<BatchDims>,
    /// How long a runner may hold a partial batch before flushing.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    /// Weight seed for the reference model.
    #[serde(default)]
    pub seed: u64,
}

impl ModelConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ModelConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ModelConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ModelConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ModelConfigError> {
        if self.stride == 0 {
            return Err(ModelConfigError::Invalid("stride must be > 0".into()));
        }
        if self.channels == 0 {
            return Err(ModelConfigError::Invalid("channels must be > 0".into()));
        }
        if self.num_states < 2 {
            return Err(ModelConfigError::Invalid("num_states must be >= 2".into()));
        }
        self.check_chunk_size(self.chunk_size)?;
        for dims in &self.batch_shapes {
            self.check_chunk_size(dims.chunk_size)?;
        }
        Ok(())
    }

    /// Chunk sizes must be positive multiples of the stride.
    pub fn check_chunk_size(&self, chunk_size: usize) -> Result<(), ModelConfigError> {
        if chunk_size == 0 || chunk_size % self.stride != 0 {
            return Err(ModelConfigError::Invalid(format!(
                "chunk size {chunk_size} is not a positive multiple of stride {}",
                self.stride
            )));
        }
        Ok(())
    }

    /// Output steps produced for a chunk of the given length.
    pub fn output_steps(&self, chunk_size: usize) -> usize {
        chunk_size / self.stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        name = "dna_r10_fast"
        chunk_size = 1000
        stride = 5
        channels = 1
        batch_timeout_ms = 250

        [[batch_shapes]]
        batch_size = 0
        chunk_size = 500
    "#;

    #[test]
    fn parses_toml_with_defaults() {
        let cfg = ModelConfig::from_toml_str(CONFIG).unwrap();
        assert_eq!(cfg.name, "dna_r10_fast");
        assert_eq!(cfg.num_states, 5);
        assert_eq!(cfg.batch_timeout_ms, 250);
        assert_eq!(cfg.batch_shapes, vec![BatchDims::new(0, 500)]);
        assert_eq!(cfg.output_steps(1000), 200);
    }

    #[test]
    fn rejects_chunk_not_multiple_of_stride() {
        let bad = CONFIG.replace("chunk_size = 500", "chunk_size = 501");
        assert!(matches!(
            ModelConfig::from_toml_str(&bad),
            Err(ModelConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_zero_stride() {
        let bad = CONFIG.replace("stride = 5", "stride = 0");
        assert!(ModelConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.toml");
        std::fs::write(&path, CONFIG).unwrap();
        let cfg = ModelConfig::load(&path).unwrap();
        assert_eq!(cfg.stride, 5);

        let missing = ModelConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ModelConfigError::Io { .. })));
    }
}
