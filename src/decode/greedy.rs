// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Greedy (argmax) decoder with blank/repeat collapse.

use super::{DecodedChunk, Decoder};
use crate::batch::OutputView;

const BASES: [char; 4] = ['A', 'C', 'G', 'T'];
const MIN_QSCORE: f32 = 1.0;
const MAX_QSCORE: f32 = 50.0;

/// State 0 is blank; state `s > 0` emits `BASES[(s - 1) % 4]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyDecoder;

impl GreedyDecoder {
    pub fn new() -> Self {
        Self
    }

    fn decode_slot(&self, output: &OutputView<'_>, slot: usize) -> DecodedChunk {
        let mut chunk = DecodedChunk {
            sequence: String::new(),
            qstring: String::new(),
            moves: Vec::with_capacity(output.steps),
        };
        let mut prev_state = 0usize;
        for step in 0..output.steps {
            let (state, prob) = argmax_softmax(output, slot, step);
            let emit = state != 0 && state != prev_state;
            if emit {
                chunk.sequence.push(BASES[(state - 1) % BASES.len()]);
                chunk.qstring.push(phred_char(prob));
            }
            chunk.moves.push(u8::from(emit));
            prev_state = state;
        }
        chunk
    }
}

impl Decoder for GreedyDecoder {
    fn decode(&self, output: OutputView<'_>, num_chunks: usize) -> Vec<DecodedChunk> {
        (0..num_chunks).map(|slot| self.decode_slot(&output, slot)).collect()
    }
}

/// Winning state and its softmax probability. Ties resolve to the lowest state.
fn argmax_softmax(output: &OutputView<'_>, slot: usize, step: usize) -> (usize, f32) {
    let scores = output.step(slot, step);
    let mut best = 0usize;
    let mut best_score = f32::NEG_INFINITY;
    for (s, score) in scores.iter().enumerate() {
        let v = score.to_f32();
        if v > best_score {
            best = s;
            best_score = v;
        }
    }
    let denom: f32 = scores.iter().map(|s| (s.to_f32() - best_score).exp()).sum();
    (best, 1.0 / denom)
}

fn phred_char(prob: f32) -> char {
    let err = (1.0 - prob).max(1e-5);
    let q = (-10.0 * err.log10()).round().clamp(MIN_QSCORE, MAX_QSCORE);
    char::from(b'!' + q as u8)
}
