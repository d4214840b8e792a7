// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Upstream side of the runner contract: push, flush, correlate.

mod batcher;

pub use batcher::{BatchError, ChunkBatcher, DEFAULT_MAX_RETRIES};
