// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Chunk batching over a single runner.
//!
//! Chunks are written into the runner's slots as they arrive. A batch is
//! flushed when every slot is filled, when the oldest pending chunk has
//! waited `batch_timeout_ms`, or on demand. Results come back paired with the
//! tag supplied at push time, in push order.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::caller::CallerError;
use crate::decode::DecodedChunk;
use crate::runner::ModelRunner;

/// Default number of sub-batch halvings on `ResourceExhausted`.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// A flush that stopped part way.
///
/// `delivered` holds the results of sub-batches that completed before the
/// failure. Chunks that were not delivered stay pending in the batcher, in
/// push order, and go out with the next flush.
#[derive(Debug)]
pub struct BatchError<T> {
    pub delivered: Vec<(T, DecodedChunk)>,
    pub error: CallerError,
}

impl<T> From<CallerError> for BatchError<T> {
    fn from(error: CallerError) -> Self {
        Self { delivered: Vec::new(), error }
    }
}

impl<T> fmt::Display for BatchError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} results delivered)", self.error, self.delivered.len())
    }
}

impl<T: fmt::Debug> std::error::Error for BatchError<T> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

struct Pending<T> {
    tag: T,
    chunk: Vec<f32>,
}

/// Put an unfinished batch back at the front, keeping push order.
fn requeue<T>(queue: &mut VecDeque<Pending<T>>, batch: Vec<Pending<T>>) {
    for p in batch.into_iter().rev() {
        queue.push_front(p);
    }
}

pub struct ChunkBatcher<T> {
    runner: ModelRunner,
    pending: Vec<Pending<T>>,
    first_pending_at: Option<Instant>,
    /// Slots no longer mirror `pending` after a failed flush.
    reload: bool,
    timeout: Duration,
    max_retries: u32,
}

impl<T> ChunkBatcher<T> {
    pub fn new(runner: ModelRunner) -> Self {
        let timeout = Duration::from_millis(runner.batch_timeout_ms());
        Self {
            pending: Vec::with_capacity(runner.batch_size()),
            runner,
            first_pending_at: None,
            reload: false,
            timeout,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn runner(&self) -> &ModelRunner {
        &self.runner
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Queue one chunk. Flushes once a full batch is pending.
    pub fn push(&mut self, tag: T, chunk: Vec<f32>) -> Result<Vec<(T, DecodedChunk)>, BatchError<T>> {
        let slot = self.pending.len();
        if slot < self.runner.batch_size() && !self.reload {
            self.runner.accept_chunk(slot, &chunk)?;
        } else {
            self.check_len(&chunk)?;
        }
        self.pending.push(Pending { tag, chunk });
        self.first_pending_at.get_or_insert_with(Instant::now);

        if self.pending.len() >= self.runner.batch_size() {
            self.flush()
        } else {
            Ok(Vec::new())
        }
    }

    /// Length check for chunks queued beyond the runner's slots.
    fn check_len(&self, chunk: &[f32]) -> Result<(), CallerError> {
        let expected = self.runner.chunk_size() * self.runner.config().channels;
        if chunk.len() == expected {
            Ok(())
        } else {
            Err(CallerError::invalid(
                self.runner.caller().device_name(),
                format!("chunk has {} samples, expected {expected}", chunk.len()),
            ))
        }
    }

    /// Time left before a partial batch is due. `None` when nothing is pending.
    pub fn time_until_flush(&self) -> Option<Duration> {
        self.first_pending_at
            .map(|t| self.timeout.saturating_sub(t.elapsed()))
    }

    /// Flush the partial batch if its timeout has elapsed.
    pub fn poll_timeout(&mut self) -> Result<Vec<(T, DecodedChunk)>, BatchError<T>> {
        match self.time_until_flush() {
            Some(left) if left.is_zero() => self.flush(),
            _ => Ok(Vec::new()),
        }
    }

    /// Execute everything pending.
    ///
    /// On `ResourceExhausted` the remaining chunks are re-submitted in
    /// sub-batches of half the size, up to `max_retries` times. Any other
    /// error, or exhaustion after the last retry, stops the flush: results
    /// decoded so far come back in the error and the rest stay pending.
    pub fn flush(&mut self) -> Result<Vec<(T, DecodedChunk)>, BatchError<T>> {
        let Some(first_pending_at) = self.first_pending_at.take() else {
            return Ok(Vec::new());
        };

        let mut queue: VecDeque<Pending<T>> = std::mem::take(&mut self.pending).into();
        let mut results = Vec::with_capacity(queue.len());
        let mut sub_batch = self.runner.batch_size();
        let mut retries = 0;
        // Slots already hold the first batch from `push` unless a failed
        // flush left them stale.
        let mut loaded = !self.reload;

        while !queue.is_empty() {
            let batch: Vec<Pending<T>> = queue.drain(..sub_batch.min(queue.len())).collect();
            let outcome = self
                .load(&batch, loaded)
                .and_then(|()| self.runner.call_chunks(batch.len()));
            loaded = false;

            match outcome {
                Ok(decoded) => {
                    results.extend(batch.into_iter().map(|p| p.tag).zip(decoded));
                }
                Err(e) if e.is_retryable() && retries < self.max_retries && batch.len() > 1 => {
                    retries += 1;
                    sub_batch = (batch.len() / 2).max(1);
                    requeue(&mut queue, batch);
                    tracing::warn!(
                        runner = %self.runner.get_name(),
                        error = %e,
                        retry = retries,
                        sub_batch,
                        "retrying with smaller batch"
                    );
                }
                Err(error) => {
                    requeue(&mut queue, batch);
                    self.pending = queue.into();
                    self.first_pending_at = Some(first_pending_at);
                    self.reload = true;
                    tracing::warn!(
                        runner = %self.runner.get_name(),
                        error = %error,
                        delivered = results.len(),
                        pending = self.pending.len(),
                        "flush stopped early"
                    );
                    return Err(BatchError { delivered: results, error });
                }
            }
        }
        self.reload = false;
        Ok(results)
    }

    /// Write `batch` into slots `0..len` unless they already hold it.
    fn load(&mut self, batch: &[Pending<T>], loaded: bool) -> Result<(), CallerError> {
        if loaded {
            return Ok(());
        }
        for (slot, p) in batch.iter().enumerate() {
            self.runner.accept_chunk(slot, &p.chunk)?;
        }
        Ok(())
    }

    /// Remove every pending chunk, e.g. to re-route it to another runner.
    pub fn take_pending(&mut self) -> Vec<(T, Vec<f32>)> {
        self.first_pending_at = None;
        self.reload = false;
        std::mem::take(&mut self.pending).into_iter().map(|p| (p.tag, p.chunk)).collect()
    }

    /// Give the runner back. Pending chunks are discarded.
    pub fn into_runner(self) -> ModelRunner {
        if !self.pending.is_empty() {
            tracing::warn!(
                runner = %self.runner.get_name(),
                discarded = self.pending.len(),
                "batcher dropped with pending chunks"
            );
        }
        self.runner
    }
}
