// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Model runner: a single worker's handle onto a shared caller.
//!
//! A runner owns one input batch, one output batch and one execution context.
//! It is driven by exactly one thread; sharing happens only through the
//! caller it points at.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use crate::batch::{InputBatch, OutputBatch};
use crate::caller::{Caller, CallerError};
use crate::decode::DecodedChunk;
use crate::device::ExecutionContext;
use crate::model::ModelConfig;
use crate::stats::NamedStats;
use crate::telemetry::{BatchSpan, SpanExt};

static NEXT_RUNNER_ID: AtomicU64 = AtomicU64::new(0);

pub struct ModelRunner {
    id: u64,
    name: String,
    caller: Arc<Caller>,
    input: InputBatch,
    output: OutputBatch,
    context: ExecutionContext,
    batches_called: Arc<AtomicU64>,
}

impl ModelRunner {
    /// Allocate this runner's buffers for shape `batch_dims_idx` of `caller`.
    pub fn new(caller: Arc<Caller>, batch_dims_idx: usize) -> Result<Self, CallerError> {
        let input = caller.create_input_buffer(batch_dims_idx)?;
        let output = caller.create_output_buffer(batch_dims_idx)?;
        let context = caller.create_execution_context();
        let id = NEXT_RUNNER_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("ModelRunner_{id}");
        tracing::debug!(
            runner = %name,
            device = %caller.device_name(),
            dims = %input.dims(),
            "runner created"
        );
        Ok(Self {
            id,
            name,
            caller,
            input,
            output,
            context,
            batches_called: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Copy `chunk` into `slot`.
    pub fn accept_chunk(&mut self, slot: usize, chunk: &[f32]) -> Result<(), CallerError> {
        self.input
            .write_slot(slot, chunk)
            .map_err(|e| CallerError::invalid(self.caller.device_name(), e.to_string()))
    }

    /// Execute slots `0..num_chunks`. Blocks until the caller completes the batch.
    pub fn call_chunks(&mut self, num_chunks: usize) -> Result<Vec<DecodedChunk>, CallerError> {
        self.batches_called.fetch_add(1, Ordering::Relaxed);
        let span = BatchSpan::new(&self.name, self.caller.device_name(), num_chunks);
        let _enter = span.enter();
        let start = Instant::now();

        let result = self
            .caller
            .call_chunks(&mut self.input, &mut self.output, num_chunks, &self.context);

        span.record("latency_ms", start.elapsed().as_secs_f64() * 1000.0);
        span.record_result(&result);
        result
    }

    /// Async form of [`Self::call_chunks`].
    pub async fn call_chunks_async(&mut self, num_chunks: usize) -> Result<Vec<DecodedChunk>, CallerError> {
        self.batches_called.fetch_add(1, Ordering::Relaxed);
        let span = BatchSpan::new(&self.name, self.caller.device_name(), num_chunks);
        let start = Instant::now();

        let result = self
            .caller
            .call_chunks_async(&mut self.input, &mut self.output, num_chunks, &self.context)
            .instrument(span.clone())
            .await;

        span.record("latency_ms", start.elapsed().as_secs_f64() * 1000.0);
        span.record_result(&result);
        result
    }

    pub fn batch_size(&self) -> usize {
        self.input.dims().batch_size
    }

    pub fn chunk_size(&self) -> usize {
        self.input.dims().chunk_size
    }

    pub fn model_stride(&self) -> usize {
        self.caller.config().stride
    }

    pub fn batch_timeout_ms(&self) -> u64 {
        self.caller.config().batch_timeout_ms
    }

    pub fn config(&self) -> &ModelConfig {
        self.caller.config()
    }

    pub fn caller(&self) -> &Arc<Caller> {
        &self.caller
    }

    /// Samples held in `slot`. `None` if the index is out of range.
    pub fn slot(&self, slot: usize) -> Option<&[f32]> {
        self.input.slot(slot)
    }

    pub fn terminate(&self) {
        self.caller.terminate();
    }

    pub fn restart(&self) -> Result<(), CallerError> {
        self.caller.restart()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unique across all runners in the process.
    pub fn get_name(&self) -> &str {
        &self.name
    }

    /// Caller counters plus this runner's `batches_called`.
    pub fn sample_stats(&self) -> NamedStats {
        self.stats_handle().sample_stats()
    }

    /// Stats view that outlives a runner moved into a worker thread.
    pub fn stats_handle(&self) -> RunnerStats {
        RunnerStats {
            name: self.name.clone(),
            caller: Arc::clone(&self.caller),
            batches_called: Arc::clone(&self.batches_called),
        }
    }
}

/// Shareable, read-only stats source for one runner.
#[derive(Clone)]
pub struct RunnerStats {
    name: String,
    caller: Arc<Caller>,
    batches_called: Arc<AtomicU64>,
}

impl RunnerStats {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sample_stats(&self) -> NamedStats {
        let mut stats = self.caller.sample_stats();
        stats.insert(
            "batches_called".into(),
            self.batches_called.load(Ordering::Relaxed) as f64,
        );
        stats
    }
}

impl std::fmt::Debug for ModelRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRunner")
            .field("name", &self.name)
            .field("device", &self.caller.device_name())
            .field("dims", &self.input.dims())
            .finish()
    }
}
