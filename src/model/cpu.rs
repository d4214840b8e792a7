// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Reference CPU model.
//!
//! Scores every stride window of a chunk independently with a seeded linear
//! layer. Deterministic for a given seed, and each slot depends only on its
//! own samples.

use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{BasecallModel, BatchDims, ModelConfig, ModelError, ModelLoader};
use crate::batch::{InputView, OutputViewMut};
use crate::device::{DeviceInfo, ExecutionContext};

/// Window features per channel: mean, span (last - first), mean |diff|.
const FEATURES_PER_CHANNEL: usize = 3;

pub struct CpuModel {
    stride: usize,
    channels: usize,
    states: usize,
    weights: Vec<f32>,
    bias: Vec<f32>,
    resident_bytes: usize,
}

impl CpuModel {
    pub fn new(config: &ModelConfig, seed: u64) -> Self {
        let features = config.channels * FEATURES_PER_CHANNEL;
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = (0..features * config.num_states)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect();
        let bias = (0..config.num_states).map(|_| rng.gen_range(-0.5f32..0.5)).collect();
        Self {
            stride: config.stride,
            channels: config.channels,
            states: config.num_states,
            weights,
            bias,
            resident_bytes: 0,
        }
    }

    fn features(&self, input: &InputView<'_>, slot: usize, step: usize, out: &mut [f32]) {
        let start = step * self.stride;
        for c in 0..self.channels {
            let window = &input.channel(slot, c)[start..start + self.stride];
            let mean = window.iter().sum::<f32>() / self.stride as f32;
            let span = window[window.len() - 1] - window[0];
            let roughness = window.windows(2).map(|w| (w[1] - w[0]).abs()).sum::<f32>()
                / self.stride as f32;
            let base = c * FEATURES_PER_CHANNEL;
            out[base] = mean;
            out[base + 1] = span;
            out[base + 2] = roughness;
        }
    }
}

impl BasecallModel for CpuModel {
    fn weight_bytes(&self) -> usize {
        (self.weights.len() + self.bias.len()) * std::mem::size_of::<f32>() + self.resident_bytes
    }

    fn workspace_bytes(&self, dims: BatchDims, num_chunks: usize) -> usize {
        num_chunks * (dims.chunk_size / self.stride) * self.states * std::mem::size_of::<f32>()
    }

    fn forward(
        &mut self,
        _context: &ExecutionContext,
        input: InputView<'_>,
        mut output: OutputViewMut<'_>,
        num_chunks: usize,
    ) -> Result<(), ModelError> {
        if input.channels != self.channels {
            return Err(ModelError::Forward(format!(
                "input has {} channels, model expects {}",
                input.channels, self.channels
            )));
        }
        if output.states != self.states {
            return Err(ModelError::Forward(format!(
                "output has {} states, model produces {}",
                output.states, self.states
            )));
        }
        let features = self.channels * FEATURES_PER_CHANNEL;
        let mut feat = vec![0.0f32; features];
        for slot in 0..num_chunks {
            for step in 0..output.steps {
                self.features(&input, slot, step, &mut feat);
                let scores = output.step_mut(slot, step);
                for (s, score) in scores.iter_mut().enumerate() {
                    let row = &self.weights[s * features..(s + 1) * features];
                    let logit = row.iter().zip(&feat).map(|(w, f)| w * f).sum::<f32>() + self.bias[s];
                    *score = f16::from_f32(logit);
                }
            }
        }
        Ok(())
    }
}

/// Loader for [`CpuModel`].
#[derive(Debug, Clone, Default)]
pub struct CpuModelLoader {
    seed: Option<u64>,
    resident_bytes: usize,
}

impl CpuModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the seed from the model config.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Extra bytes the loaded weights occupy, to model a real footprint.
    pub fn with_resident_bytes(mut self, bytes: usize) -> Self {
        self.resident_bytes = bytes;
        self
    }
}

impl ModelLoader for CpuModelLoader {
    fn load(&self, config: &ModelConfig, device: &DeviceInfo) -> Result<Box<dyn BasecallModel>, ModelError> {
        config
            .validate()
            .map_err(|e| ModelError::Incompatible(e.to_string()))?;
        let mut model = CpuModel::new(config, self.seed.unwrap_or(config.seed));
        model.resident_bytes = self.resident_bytes;
        tracing::debug!(model = %config.name, device = %device.id, "reference model loaded");
        Ok(Box::new(model))
    }
}
