// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! FIFO execution queue and the single executor thread draining it.
//!
//! Runners admit jobs under the queue lock; the executor pops them one at a
//! time, so device launches for a caller never overlap. The executor only
//! exits once the caller is terminated and the queue is empty.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use half::f16;
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;

use super::error::CallerError;
use super::lifecycle::CallerState;
use crate::batch::{InputView, OutputView, OutputViewMut};
use crate::decode::{DecodedChunk, Decoder};
use crate::device::{DeviceAllocator, DeviceMemory, ExecutionContext};
use crate::model::{BasecallModel, BatchDims};
use crate::stats::CallerCounters;
use crate::telemetry;

/// Completion channel type delivering a job back to its runner.
pub(super) type OutcomeTx = oneshot::Sender<JobOutcome>;
pub(super) type OutcomeRx = oneshot::Receiver<JobOutcome>;

/// A batch in flight. Buffer storage travels with the job.
pub(super) struct Job {
    pub samples: Vec<f32>,
    pub scores: Vec<f16>,
    pub dims: BatchDims,
    pub channels: usize,
    pub steps: usize,
    pub states: usize,
    pub num_chunks: usize,
    pub context: ExecutionContext,
    pub enqueued_at: Instant,
    pub reply: OutcomeTx,
}

/// Buffers handed back plus the decoded result.
pub(super) struct JobOutcome {
    pub samples: Vec<f32>,
    pub scores: Vec<f16>,
    pub result: Result<Vec<DecodedChunk>, CallerError>,
}

struct QueueState {
    state: CallerState,
    jobs: VecDeque<Job>,
}

/// Lifecycle-aware FIFO queue shared by a caller and its executor.
pub(super) struct ExecutionQueue {
    inner: Mutex<QueueState>,
    work_ready: Condvar,
}

impl ExecutionQueue {
    pub fn new(state: CallerState) -> Self {
        Self {
            inner: Mutex::new(QueueState { state, jobs: VecDeque::new() }),
            work_ready: Condvar::new(),
        }
    }

    /// Admit a job if running. `make_job` runs under the queue lock, so the
    /// state check and the enqueue are atomic.
    pub fn admit(&self, make_job: impl FnOnce() -> Job) -> bool {
        let mut q = self.inner.lock();
        if q.state != CallerState::Running {
            return false;
        }
        q.jobs.push_back(make_job());
        drop(q);
        self.work_ready.notify_one();
        true
    }

    /// Block until a job is available. `None` once terminated and drained.
    fn next_job(&self) -> Option<Job> {
        let mut q = self.inner.lock();
        loop {
            if let Some(job) = q.jobs.pop_front() {
                return Some(job);
            }
            if q.state == CallerState::Terminated {
                return None;
            }
            self.work_ready.wait(&mut q);
        }
    }

    pub fn state(&self) -> CallerState {
        self.inner.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == CallerState::Running
    }

    pub fn set_state(&self, state: CallerState) {
        self.inner.lock().state = state;
        self.work_ready.notify_all();
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Remove jobs left behind by an executor that exited abnormally.
    pub fn drain_remaining(&self) -> Vec<Job> {
        self.inner.lock().jobs.drain(..).collect()
    }
}

/// State owned by the executor thread for one RUNNING period.
pub(super) struct Executor {
    pub model: Box<dyn BasecallModel>,
    pub weights: DeviceMemory,
    pub decoder: Arc<dyn Decoder>,
    pub allocator: Arc<dyn DeviceAllocator>,
    pub counters: Arc<CallerCounters>,
    pub device: String,
}

pub(super) fn spawn(executor: Executor, queue: Arc<ExecutionQueue>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("caller-{}", executor.device))
        .spawn(move || executor.run(&queue))
}

impl Executor {
    fn run(mut self, queue: &ExecutionQueue) {
        let span = tracing::info_span!("executor", device = %self.device);
        let _enter = span.enter();
        tracing::debug!(weight_bytes = self.weights.size(), "executor started");

        while let Some(job) = queue.next_job() {
            self.execute(job);
        }

        tracing::debug!("executor stopped");
    }

    fn execute(&mut self, job: Job) {
        let Job {
            samples,
            mut scores,
            dims,
            channels,
            steps,
            states,
            num_chunks,
            context,
            enqueued_at,
            reply,
        } = job;
        let queue_wait = enqueued_at.elapsed();

        let input = InputView { dims, channels, samples: &samples };
        let result = self.run_batch(&context, input, &mut scores, steps, states, num_chunks);

        match &result {
            Ok(_) => {}
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, num_chunks, "batch exceeded memory budget");
            }
            Err(e) => {
                telemetry::record_failure(&self.device);
                tracing::error!(error = %e, num_chunks, "batch failed");
            }
        }
        if let Some((model, decode)) = result.as_ref().ok().map(|(_, t)| *t) {
            self.counters.record_batch(num_chunks, queue_wait, model, decode);
            telemetry::record_batch(&self.device, num_chunks, model, decode);
            tracing::debug!(
                num_chunks,
                queue_wait_us = queue_wait.as_micros() as u64,
                model_us = model.as_micros() as u64,
                decode_us = decode.as_micros() as u64,
                "batch executed"
            );
        }

        let outcome = JobOutcome { samples, scores, result: result.map(|(chunks, _)| chunks) };
        if reply.send(outcome).is_err() {
            tracing::debug!("runner stopped waiting before batch completion");
        }
    }

    /// Forward + decode. Returns results and (model, decode) timings.
    fn run_batch(
        &mut self,
        context: &ExecutionContext,
        input: InputView<'_>,
        scores: &mut [f16],
        steps: usize,
        states: usize,
        num_chunks: usize,
    ) -> Result<(Vec<DecodedChunk>, (Duration, Duration)), CallerError> {
        let workspace_bytes = self.model.workspace_bytes(input.dims, num_chunks);
        let _workspace = DeviceMemory::reserve(&self.allocator, workspace_bytes)
            .map_err(|e| CallerError::from_device(&self.device, e))?;

        let model_start = Instant::now();
        let output = OutputViewMut { steps, states, scores: &mut *scores };
        let model = &mut self.model;
        catch_unwind(AssertUnwindSafe(|| model.forward(context, input, output, num_chunks)))
            .map_err(|_| CallerError::device_failure(&self.device, "model forward panicked"))?
            .map_err(|e| CallerError::device_failure(&self.device, e.to_string()))?;
        let model_time = model_start.elapsed();

        let decode_start = Instant::now();
        let view = OutputView { steps, states, scores: &*scores };
        let decoder = &self.decoder;
        let decoded = catch_unwind(AssertUnwindSafe(|| decoder.decode(view, num_chunks)))
            .map_err(|_| CallerError::device_failure(&self.device, "decoder panicked"))?;
        let decode_time = decode_start.elapsed();

        if decoded.len() != num_chunks {
            return Err(CallerError::device_failure(
                &self.device,
                format!("decoder returned {} results for {num_chunks} chunks", decoded.len()),
            ));
        }
        Ok((decoded, (model_time, decode_time)))
    }
}
