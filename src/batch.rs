// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Input and output batch buffers.
//!
//! Buffers are allocated once per runner against the caller's memory budget
//! and reused in place for the runner's lifetime. While a batch executes its
//! sample and score storage travels to the executor and back, so the runner
//! never shares memory with another thread.

use half::f16;
use thiserror::Error;

use crate::device::DeviceMemory;
use crate::model::BatchDims;

/// Slot-level write failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("slot {slot} out of range for batch size {batch_size}")]
    OutOfRange { slot: usize, batch_size: usize },

    #[error("chunk has {actual} samples, expected {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("batch storage is detached")]
    Detached,
}

/// Samples laid out as `[batch_size, channels, chunk_size]`.
#[derive(Debug)]
pub struct InputBatch {
    dims: BatchDims,
    channels: usize,
    samples: Vec<f32>,
    _reservation: DeviceMemory,
}

impl InputBatch {
    pub(crate) fn new(dims: BatchDims, channels: usize, reservation: DeviceMemory) -> Self {
        Self {
            dims,
            channels,
            samples: vec![0.0; Self::len_for(dims, channels)],
            _reservation: reservation,
        }
    }

    pub(crate) fn bytes_for(dims: BatchDims, channels: usize) -> usize {
        Self::len_for(dims, channels) * std::mem::size_of::<f32>()
    }

    fn len_for(dims: BatchDims, channels: usize) -> usize {
        dims.batch_size * channels * dims.chunk_size
    }

    pub fn dims(&self) -> BatchDims {
        self.dims
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Samples per slot (`channels × chunk_size`).
    pub fn chunk_len(&self) -> usize {
        self.channels * self.dims.chunk_size
    }

    /// Copy one chunk into `slot`.
    pub fn write_slot(&mut self, slot: usize, chunk: &[f32]) -> Result<(), SlotError> {
        if slot >= self.dims.batch_size {
            return Err(SlotError::OutOfRange { slot, batch_size: self.dims.batch_size });
        }
        let len = self.chunk_len();
        if chunk.len() != len {
            return Err(SlotError::LengthMismatch { expected: len, actual: chunk.len() });
        }
        let target = self
            .samples
            .get_mut(slot * len..(slot + 1) * len)
            .ok_or(SlotError::Detached)?;
        target.copy_from_slice(chunk);
        Ok(())
    }

    /// Samples currently held in `slot`. `None` if out of range or detached.
    pub fn slot(&self, slot: usize) -> Option<&[f32]> {
        if slot >= self.dims.batch_size {
            return None;
        }
        let len = self.chunk_len();
        self.samples.get(slot * len..(slot + 1) * len)
    }

    pub(crate) fn is_intact(&self) -> bool {
        self.samples.len() == Self::len_for(self.dims, self.channels)
    }

    pub(crate) fn take_samples(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    pub(crate) fn restore_samples(&mut self, samples: Vec<f32>) {
        self.samples = samples;
    }

    /// Re-zero storage lost with a failed executor.
    pub(crate) fn reset_samples(&mut self) {
        self.samples = vec![0.0; Self::len_for(self.dims, self.channels)];
    }
}

/// Scores laid out as `[batch_size, steps, states]`.
#[derive(Debug)]
pub struct OutputBatch {
    dims: BatchDims,
    steps: usize,
    states: usize,
    scores: Vec<f16>,
    _reservation: DeviceMemory,
}

impl OutputBatch {
    pub(crate) fn new(dims: BatchDims, steps: usize, states: usize, reservation: DeviceMemory) -> Self {
        Self {
            dims,
            steps,
            states,
            scores: vec![f16::ZERO; dims.batch_size * steps * states],
            _reservation: reservation,
        }
    }

    pub(crate) fn bytes_for(dims: BatchDims, steps: usize, states: usize) -> usize {
        dims.batch_size * steps * states * std::mem::size_of::<f16>()
    }

    pub fn dims(&self) -> BatchDims {
        self.dims
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn states(&self) -> usize {
        self.states
    }

    pub(crate) fn is_intact(&self) -> bool {
        self.scores.len() == self.dims.batch_size * self.steps * self.states
    }

    pub(crate) fn take_scores(&mut self) -> Vec<f16> {
        std::mem::take(&mut self.scores)
    }

    pub(crate) fn restore_scores(&mut self, scores: Vec<f16>) {
        self.scores = scores;
    }

    pub(crate) fn reset_scores(&mut self) {
        self.scores = vec![f16::ZERO; self.dims.batch_size * self.steps * self.states];
    }
}

/// Read-only view of input samples handed to a model.
#[derive(Debug, Clone, Copy)]
pub struct InputView<'a> {
    pub dims: BatchDims,
    pub channels: usize,
    pub samples: &'a [f32],
}

impl<'a> InputView<'a> {
    /// Samples of channel `channel` in `slot`.
    pub fn channel(&self, slot: usize, channel: usize) -> &'a [f32] {
        let chunk = self.dims.chunk_size;
        let start = (slot * self.channels + channel) * chunk;
        &self.samples[start..start + chunk]
    }
}

/// Writable view of the score buffer handed to a model.
#[derive(Debug)]
pub struct OutputViewMut<'a> {
    pub steps: usize,
    pub states: usize,
    pub scores: &'a mut [f16],
}

impl OutputViewMut<'_> {
    /// Scores of one step of one slot.
    pub fn step_mut(&mut self, slot: usize, step: usize) -> &mut [f16] {
        let start = (slot * self.steps + step) * self.states;
        &mut self.scores[start..start + self.states]
    }
}

/// Read-only view of model output handed to a decoder.
#[derive(Debug, Clone, Copy)]
pub struct OutputView<'a> {
    pub steps: usize,
    pub states: usize,
    pub scores: &'a [f16],
}

impl<'a> OutputView<'a> {
    pub fn step(&self, slot: usize, step: usize) -> &'a [f16] {
        let start = (slot * self.steps + step) * self.states;
        &self.scores[start..start + self.states]
    }
}
