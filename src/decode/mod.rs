// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Decoding contract between raw model output and per-chunk results.

mod greedy;

pub use greedy::GreedyDecoder;

use serde::{Deserialize, Serialize};

use crate::batch::OutputView;

/// Decoded sequence, qualities and moves for exactly one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DecodedChunk {
    pub sequence: String,
    /// Phred+33 quality string, one character per base.
    pub qstring: String,
    /// One entry per output step; 1 where a base was emitted.
    pub moves: Vec<u8>,
}

/// Transforms raw scores into decoded chunks.
///
/// Must return exactly `num_chunks` results, one per slot in slot order,
/// each independent of the others and deterministic for identical input.
pub trait Decoder: Send + Sync {
    fn decode(&self, output: OutputView<'_>, num_chunks: usize) -> Vec<DecodedChunk>;
}
