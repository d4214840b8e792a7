// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Batch size selection from the memory budget.

/// Auto-selected batch sizes are multiples of this.
pub const BATCH_GRANULARITY: usize = 64;

/// Upper bound for auto-selected batch sizes.
pub const MAX_AUTO_BATCH_SIZE: usize = 4096;

/// Per-chunk byte costs of one runner's buffers.
#[derive(Debug, Clone, Copy)]
pub(super) struct ChunkFootprint {
    pub input_bytes: usize,
    pub output_bytes: usize,
}

/// Largest granule multiple whose buffers for `runners` runners plus one
/// batch of workspace fit in `available` bytes. `None` if one granule does
/// not fit.
pub(super) fn auto_batch_size(
    available: usize,
    footprint: ChunkFootprint,
    runners: usize,
    workspace_bytes: impl Fn(usize) -> usize,
) -> Option<usize> {
    let per_chunk = footprint.input_bytes + footprint.output_bytes;
    let fits = |batch: usize| {
        let buffers = runners.max(1).saturating_mul(batch).saturating_mul(per_chunk);
        buffers.saturating_add(workspace_bytes(batch)) <= available
    };

    let mut best = None;
    let mut batch = BATCH_GRANULARITY;
    while batch <= MAX_AUTO_BATCH_SIZE && fits(batch) {
        best = Some(batch);
        batch += BATCH_GRANULARITY;
    }
    best
}
