// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Model contracts: configuration, loading and the opaque forward pass.
//!
//! A [`BasecallModel`] lives on its caller's executor thread. Only the first
//! `num_chunks` slots of a batch may be read by `forward`.

mod config;
mod cpu;

pub use config::{BatchDims, ModelConfig, ModelConfigError};
pub use cpu::{CpuModel, CpuModelLoader};

use thiserror::Error;

use crate::batch::{InputView, OutputViewMut};
use crate::device::{DeviceInfo, ExecutionContext};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model load failed: {0}")]
    Load(String),

    #[error("Model incompatible with configuration: {0}")]
    Incompatible(String),

    #[error("Forward pass failed: {0}")]
    Forward(String),
}

/// A device-resident network.
pub trait BasecallModel: Send {
    /// Bytes held by weights for the model's lifetime.
    fn weight_bytes(&self) -> usize;

    /// Scratch bytes needed to execute `num_chunks` chunks of shape `dims`.
    fn workspace_bytes(&self, dims: BatchDims, num_chunks: usize) -> usize;

    /// Run the forward pass over slots `0..num_chunks`.
    fn forward(
        &mut self,
        context: &ExecutionContext,
        input: InputView<'_>,
        output: OutputViewMut<'_>,
        num_chunks: usize,
    ) -> Result<(), ModelError>;
}

/// Loads model weights onto a device. Called at caller construction and on
/// every restart.
pub trait ModelLoader: Send + Sync {
    fn load(&self, config: &ModelConfig, device: &DeviceInfo) -> Result<Box<dyn BasecallModel>, ModelError>;
}
