// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Caller: the per-device resource owner and execution serializer.
//!
//! One caller exists per device. It owns the model weights, the memory
//! budget, the execution queue and the lifecycle state, and is shared by
//! every runner on that device through an `Arc`. Calls block the invoking
//! thread until the single executor has run forward + decode for the batch.

mod error;
mod executor;
mod lifecycle;
mod sizing;

pub use error::CallerError;
pub use lifecycle::CallerState;
pub use sizing::{BATCH_GRANULARITY, MAX_AUTO_BATCH_SIZE};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::batch::{InputBatch, OutputBatch};
use crate::decode::{DecodedChunk, Decoder, GreedyDecoder};
use crate::device::{
    BudgetAllocator, ClaimMode, DeviceAllocator, DeviceClaim, DeviceInfo, DeviceManager,
    DeviceMemory, ExecutionContext,
};
use crate::model::{BasecallModel, BatchDims, CpuModelLoader, ModelConfig, ModelLoader};
use crate::stats::{CallerCounters, NamedStats};
use crate::telemetry;
use executor::{ExecutionQueue, Executor, Job, JobOutcome, OutcomeRx};
use lifecycle::Lifecycle;
use sizing::ChunkFootprint;

/// Caller construction parameters.
#[derive(Debug, Clone)]
pub struct CallerConfig {
    /// Chunk length for the primary shape; 0 uses the model default.
    pub chunk_size: usize,
    /// Batch size for the primary shape; 0 sizes it from the memory budget.
    pub batch_size: usize,
    /// Device identifier (`cpu`, `cuda:N`, `metal`).
    pub device: String,
    /// Fraction of device memory this caller may reserve, in (0, 1].
    pub memory_limit_fraction: f32,
    /// Claim the device exclusively for the session.
    pub exclusive_gpu_access: bool,
    /// Runners expected to allocate buffers, used by automatic batch sizing.
    pub expected_runners: usize,
}

impl Default for CallerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 0,
            batch_size: 0,
            device: "cpu".to_string(),
            memory_limit_fraction: 0.9,
            exclusive_gpu_access: false,
            expected_runners: 2,
        }
    }
}

/// Per-device caller. See the module docs.
pub struct Caller {
    device: DeviceInfo,
    device_name: String,
    model_config: Arc<ModelConfig>,
    batch_dims: Vec<BatchDims>,
    allocator: Arc<dyn DeviceAllocator>,
    decoder: Arc<dyn Decoder>,
    queue: Arc<ExecutionQueue>,
    counters: Arc<CallerCounters>,
    lifecycle: Mutex<Lifecycle>,
    next_context_id: AtomicU64,
    claim: DeviceClaim,
}

impl Caller {
    /// Build a caller, load the model and start its executor.
    pub fn new(
        model_config: Arc<ModelConfig>,
        config: CallerConfig,
        loader: Arc<dyn ModelLoader>,
        decoder: Arc<dyn Decoder>,
        devices: &Arc<DeviceManager>,
    ) -> Result<Arc<Self>, CallerError> {
        let fraction = config.memory_limit_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(CallerError::config(
                &config.device,
                format!("memory_limit_fraction {fraction} outside (0, 1]"),
            ));
        }
        model_config
            .validate()
            .map_err(|e| CallerError::config(&config.device, e.to_string()))?;

        let device = devices
            .resolve(&config.device)
            .map_err(|e| CallerError::config(&config.device, e.to_string()))?;
        let device_name = device.id.to_string();
        let mode = if config.exclusive_gpu_access { ClaimMode::Exclusive } else { ClaimMode::Shared };
        let claim = devices
            .claim(&device.id, mode)
            .map_err(|e| CallerError::config(&device_name, e.to_string()))?;

        let chunk_size = match config.chunk_size {
            0 => model_config.chunk_size,
            n => n,
        };
        model_config
            .check_chunk_size(chunk_size)
            .map_err(|e| CallerError::config(&device_name, e.to_string()))?;

        let budget = device.budget_bytes(fraction) as usize;
        let allocator: Arc<dyn DeviceAllocator> = Arc::new(BudgetAllocator::new(budget));

        let model = loader
            .load(&model_config, &device)
            .map_err(|e| CallerError::config(&device_name, e.to_string()))?;
        let weights = DeviceMemory::reserve(&allocator, model.weight_bytes())
            .map_err(|e| CallerError::from_device(&device_name, e))?;

        let batch_size = match config.batch_size {
            0 => Self::auto_batch_size(&model_config, &*model, &*allocator, chunk_size, config.expected_runners)
                .ok_or_else(|| {
                    let fp = Self::footprint(&model_config, chunk_size);
                    let per_granule = (fp.input_bytes + fp.output_bytes) * BATCH_GRANULARITY;
                    CallerError::ResourceExhausted {
                        device: device_name.clone(),
                        requested: (per_granule * config.expected_runners.max(1)) as u64,
                        available: allocator.capacity().saturating_sub(allocator.allocated_bytes()) as u64,
                    }
                })?,
            n => n,
        };
        tracing::debug!(device = %device_name, batch_size, auto = config.batch_size == 0, "batch size selected");
        let batch_dims = Self::batch_shapes(&model_config, BatchDims::new(batch_size, chunk_size))
            .map_err(|reason| CallerError::config(&device_name, reason))?;

        let caller = Arc::new(Self {
            device,
            device_name,
            model_config,
            batch_dims,
            allocator,
            decoder,
            queue: Arc::new(ExecutionQueue::new(CallerState::Terminated)),
            counters: Arc::new(CallerCounters::new()),
            lifecycle: Mutex::new(Lifecycle::new(loader)),
            next_context_id: AtomicU64::new(1),
            claim,
        });
        {
            let mut lc = caller.lifecycle.lock();
            caller.start_executor(&mut lc, model, weights)?;
        }

        tracing::info!(
            device = %caller.device_name,
            model = %caller.model_config.name,
            batch_size,
            chunk_size,
            shapes = caller.batch_dims.len(),
            budget_bytes = budget,
            exclusive = config.exclusive_gpu_access,
            "caller started"
        );
        Ok(caller)
    }

    /// Caller running the reference CPU model and greedy decoder.
    pub fn with_reference_model(
        model_config: Arc<ModelConfig>,
        config: CallerConfig,
        devices: &Arc<DeviceManager>,
    ) -> Result<Arc<Self>, CallerError> {
        Self::new(
            model_config,
            config,
            Arc::new(CpuModelLoader::new()),
            Arc::new(GreedyDecoder::new()),
            devices,
        )
    }

    fn footprint(model_config: &ModelConfig, chunk_size: usize) -> ChunkFootprint {
        let one = BatchDims::new(1, chunk_size);
        let steps = model_config.output_steps(chunk_size);
        ChunkFootprint {
            input_bytes: InputBatch::bytes_for(one, model_config.channels),
            output_bytes: OutputBatch::bytes_for(one, steps, model_config.num_states),
        }
    }

    fn auto_batch_size(
        model_config: &ModelConfig,
        model: &dyn BasecallModel,
        allocator: &dyn DeviceAllocator,
        chunk_size: usize,
        runners: usize,
    ) -> Option<usize> {
        let available = allocator.capacity().saturating_sub(allocator.allocated_bytes());
        sizing::auto_batch_size(available, Self::footprint(model_config, chunk_size), runners, |batch| {
            model.workspace_bytes(BatchDims::new(batch, chunk_size), batch)
        })
    }

    /// Primary shape first, then deduplicated extra shapes from the model config.
    fn batch_shapes(model_config: &ModelConfig, primary: BatchDims) -> Result<Vec<BatchDims>, String> {
        let mut shapes = vec![primary];
        for extra in &model_config.batch_shapes {
            let dims = BatchDims {
                batch_size: if extra.batch_size == 0 { primary.batch_size } else { extra.batch_size },
                chunk_size: extra.chunk_size,
            };
            model_config.check_chunk_size(dims.chunk_size).map_err(|e| e.to_string())?;
            if !shapes.contains(&dims) {
                shapes.push(dims);
            }
        }
        Ok(shapes)
    }

    fn start_executor(
        &self,
        lc: &mut Lifecycle,
        model: Box<dyn BasecallModel>,
        weights: DeviceMemory,
    ) -> Result<(), CallerError> {
        let executor = Executor {
            model,
            weights,
            decoder: Arc::clone(&self.decoder),
            allocator: Arc::clone(&self.allocator),
            counters: Arc::clone(&self.counters),
            device: self.device_name.clone(),
        };
        let handle = executor::spawn(executor, Arc::clone(&self.queue))
            .map_err(|e| CallerError::device_failure(&self.device_name, format!("executor spawn failed: {e}")))?;
        lc.executor = Some(handle);
        self.queue.set_state(CallerState::Running);
        Ok(())
    }

    fn shape_index(&self, dims: BatchDims) -> Result<usize, CallerError> {
        self.batch_dims
            .iter()
            .position(|d| *d == dims)
            .ok_or_else(|| CallerError::invalid(&self.device_name, format!("unsupported batch shape {dims}")))
    }

    fn dims_at(&self, batch_dims_idx: usize) -> Result<BatchDims, CallerError> {
        self.batch_dims.get(batch_dims_idx).copied().ok_or_else(|| {
            CallerError::invalid(
                &self.device_name,
                format!("batch shape index {batch_dims_idx} out of range ({} shapes)", self.batch_dims.len()),
            )
        })
    }

    fn ensure_running(&self) -> Result<(), CallerError> {
        if self.queue.is_running() {
            Ok(())
        } else {
            Err(CallerError::terminated(&self.device_name))
        }
    }

    /// Allocate an input buffer for shape `batch_dims_idx` from the budget.
    pub fn create_input_buffer(&self, batch_dims_idx: usize) -> Result<InputBatch, CallerError> {
        self.ensure_running()?;
        let dims = self.dims_at(batch_dims_idx)?;
        let channels = self.model_config.channels;
        let reservation = DeviceMemory::reserve(&self.allocator, InputBatch::bytes_for(dims, channels))
            .map_err(|e| CallerError::from_device(&self.device_name, e))?;
        Ok(InputBatch::new(dims, channels, reservation))
    }

    /// Allocate an output buffer for shape `batch_dims_idx` from the budget.
    pub fn create_output_buffer(&self, batch_dims_idx: usize) -> Result<OutputBatch, CallerError> {
        self.ensure_running()?;
        let dims = self.dims_at(batch_dims_idx)?;
        let steps = self.model_config.output_steps(dims.chunk_size);
        let states = self.model_config.num_states;
        let reservation = DeviceMemory::reserve(&self.allocator, OutputBatch::bytes_for(dims, steps, states))
            .map_err(|e| CallerError::from_device(&self.device_name, e))?;
        Ok(OutputBatch::new(dims, steps, states, reservation))
    }

    /// New stream handle bound to this caller's device.
    pub fn create_execution_context(&self) -> ExecutionContext {
        let id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        ExecutionContext::new(id, self.device.id.clone())
    }

    /// Execute slots `0..num_chunks` of `input` and return their decoded
    /// results in slot order. Blocks until the batch completes.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`Self::call_chunks_async`] there.
    pub fn call_chunks(
        &self,
        input: &mut InputBatch,
        output: &mut OutputBatch,
        num_chunks: usize,
        context: &ExecutionContext,
    ) -> Result<Vec<DecodedChunk>, CallerError> {
        match self.submit(input, output, num_chunks, context)? {
            Some(rx) => self.complete(input, output, rx.blocking_recv().ok()),
            None => Ok(Vec::new()),
        }
    }

    /// Async form of [`Self::call_chunks`]: awaits the completion signal.
    ///
    /// Cancel-safe. A batch already admitted still executes, but its results
    /// are discarded and the buffers come back zeroed.
    pub async fn call_chunks_async(
        &self,
        input: &mut InputBatch,
        output: &mut OutputBatch,
        num_chunks: usize,
        context: &ExecutionContext,
    ) -> Result<Vec<DecodedChunk>, CallerError> {
        let Some(rx) = self.submit(input, output, num_chunks, context)? else {
            return Ok(Vec::new());
        };
        let mut in_flight = InFlight { input, output, device: &self.device_name, armed: true };
        let outcome = rx.await.ok();
        in_flight.armed = false;
        self.complete(&mut *in_flight.input, &mut *in_flight.output, outcome)
    }

    fn validate(
        &self,
        input: &InputBatch,
        output: &OutputBatch,
        num_chunks: usize,
        context: &ExecutionContext,
    ) -> Result<(), CallerError> {
        if context.device() != &self.device.id {
            return Err(CallerError::invalid(
                &self.device_name,
                format!("execution context belongs to {}", context.device()),
            ));
        }
        let dims = input.dims();
        self.shape_index(dims)?;
        if input.channels() != self.model_config.channels {
            return Err(CallerError::invalid(
                &self.device_name,
                format!("input has {} channels, model expects {}", input.channels(), self.model_config.channels),
            ));
        }
        let steps = self.model_config.output_steps(dims.chunk_size);
        if output.dims() != dims || output.steps() != steps || output.states() != self.model_config.num_states {
            return Err(CallerError::invalid(
                &self.device_name,
                format!(
                    "output shape {}x{}x{} does not match input shape {dims}",
                    output.dims().batch_size,
                    output.steps(),
                    output.states()
                ),
            ));
        }
        if !input.is_intact() || !output.is_intact() {
            return Err(CallerError::invalid(&self.device_name, "batch storage is detached"));
        }
        if num_chunks > dims.batch_size {
            return Err(CallerError::invalid(
                &self.device_name,
                format!("num_chunks {num_chunks} exceeds batch size {}", dims.batch_size),
            ));
        }
        Ok(())
    }

    /// Validate and enqueue. `None` for an empty batch.
    fn submit(
        &self,
        input: &mut InputBatch,
        output: &mut OutputBatch,
        num_chunks: usize,
        context: &ExecutionContext,
    ) -> Result<Option<OutcomeRx>, CallerError> {
        self.validate(input, output, num_chunks, context)?;

        if num_chunks == 0 {
            self.ensure_running().map_err(|e| self.rejected(e))?;
            return Ok(None);
        }

        let (tx, rx) = tokio::sync::oneshot::channel();
        let admitted = self.queue.admit(|| Job {
            samples: input.take_samples(),
            scores: output.take_scores(),
            dims: input.dims(),
            channels: input.channels(),
            steps: output.steps(),
            states: output.states(),
            num_chunks,
            context: context.clone(),
            enqueued_at: Instant::now(),
            reply: tx,
        });
        if !admitted {
            return Err(self.rejected(CallerError::terminated(&self.device_name)));
        }
        Ok(Some(rx))
    }

    fn rejected(&self, err: CallerError) -> CallerError {
        self.counters.record_rejection();
        telemetry::record_rejection(&self.device_name);
        tracing::debug!(device = %self.device_name, "call rejected: caller terminated");
        err
    }

    /// Restore buffer storage and unwrap the result.
    fn complete(
        &self,
        input: &mut InputBatch,
        output: &mut OutputBatch,
        outcome: Option<JobOutcome>,
    ) -> Result<Vec<DecodedChunk>, CallerError> {
        match outcome {
            Some(JobOutcome { samples, scores, result }) => {
                input.restore_samples(samples);
                output.restore_scores(scores);
                result
            }
            None => {
                input.reset_samples();
                output.reset_scores();
                Err(CallerError::device_failure(
                    &self.device_name,
                    "executor exited before completing the batch",
                ))
            }
        }
    }

    /// RUNNING -> TERMINATED. Admitted batches finish first; weights are
    /// released once the executor stops. Idempotent.
    pub fn terminate(&self) {
        let mut lc = self.lifecycle.lock();
        self.terminate_locked(&mut lc);
    }

    fn terminate_locked(&self, lc: &mut Lifecycle) {
        self.queue.set_state(CallerState::Terminated);
        let Some(handle) = lc.executor.take() else {
            return;
        };
        if handle.join().is_err() {
            tracing::error!(device = %self.device_name, "executor thread panicked");
        }
        for job in self.queue.drain_remaining() {
            let _ = job.reply.send(JobOutcome {
                samples: job.samples,
                scores: job.scores,
                result: Err(CallerError::terminated(&self.device_name)),
            });
        }
        tracing::info!(device = %self.device_name, "caller terminated");
    }

    /// TERMINATED -> RUNNING, reloading weights. No-op when running.
    pub fn restart(&self) -> Result<(), CallerError> {
        let mut lc = self.lifecycle.lock();
        self.restart_locked(&mut lc)
    }

    fn restart_locked(&self, lc: &mut Lifecycle) -> Result<(), CallerError> {
        if lc.is_running() {
            return Ok(());
        }
        let model = lc
            .loader
            .load(&self.model_config, &self.device)
            .map_err(|e| CallerError::config(&self.device_name, e.to_string()))?;
        let weights = DeviceMemory::reserve(&self.allocator, model.weight_bytes())
            .map_err(|e| CallerError::from_device(&self.device_name, e))?;
        self.start_executor(lc, model, weights)?;
        self.counters.record_restart();
        tracing::info!(device = %self.device_name, "caller restarted");
        Ok(())
    }

    /// Hot swap: drain, replace the loader, restart with the new weights.
    /// On failure the caller stays terminated.
    pub fn swap_model(&self, loader: Arc<dyn ModelLoader>) -> Result<(), CallerError> {
        let mut lc = self.lifecycle.lock();
        let drain_start = Instant::now();
        self.terminate_locked(&mut lc);
        lc.loader = loader;
        let result = self.restart_locked(&mut lc);
        match &result {
            Ok(()) => tracing::info!(
                device = %self.device_name,
                drain_ms = drain_start.elapsed().as_millis() as u64,
                "model swapped"
            ),
            Err(e) => tracing::error!(device = %self.device_name, error = %e, "model swap failed"),
        }
        result
    }

    pub fn state(&self) -> CallerState {
        self.queue.state()
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn model_config(&self) -> &Arc<ModelConfig> {
        &self.model_config
    }

    /// Supported shapes; index 0 is the primary shape.
    pub fn batch_dims(&self) -> &[BatchDims] {
        &self.batch_dims
    }

    pub fn is_exclusive(&self) -> bool {
        self.claim.mode() == ClaimMode::Exclusive
    }

    pub fn memory_budget(&self) -> usize {
        self.allocator.capacity()
    }

    pub fn memory_reserved(&self) -> usize {
        self.allocator.allocated_bytes()
    }

    /// Point-in-time read of this caller's counters.
    pub fn sample_stats(&self) -> NamedStats {
        let mut stats = self.counters.snapshot();
        stats.insert("memory_budget_bytes".into(), self.memory_budget() as f64);
        stats.insert("memory_reserved_bytes".into(), self.memory_reserved() as f64);
        stats.insert("memory_peak_bytes".into(), self.allocator.peak_bytes() as f64);
        stats.insert("queue_depth".into(), self.queue.depth() as f64);
        stats.insert("running".into(), if self.queue.is_running() { 1.0 } else { 0.0 });
        stats
    }
}

/// Buffers whose storage is out with the executor. If the awaiting future
/// is dropped first, the storage is re-zeroed so the runner stays usable.
struct InFlight<'a> {
    input: &'a mut InputBatch,
    output: &'a mut OutputBatch,
    device: &'a str,
    armed: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.input.reset_samples();
            self.output.reset_scores();
            tracing::debug!(device = %self.device, "async call dropped before completion; buffers reset");
        }
    }
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("device", &self.device_name)
            .field("model", &self.model_config.name)
            .field("batch_dims", &self.batch_dims)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Caller {
    fn drop(&mut self) {
        let lc = self.lifecycle.get_mut();
        if lc.is_running() {
            self.queue.set_state(CallerState::Terminated);
            if let Some(handle) = lc.executor.take() {
                let _ = handle.join();
            }
        }
        tracing::debug!(device = %self.device_name, "caller dropped");
    }
}

#[cfg(test)]
#[path = "caller_tests.rs"]
mod tests;
