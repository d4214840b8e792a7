// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Span utilities for batch calls.

use tracing::{debug_span, Span};

/// Extension trait for recording outcomes into a span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for per-call spans.
pub struct BatchSpan;

impl BatchSpan {
    /// Fields: `runner`, `device`, `num_chunks`, then `status`,
    /// `error.message` and `latency_ms` filled in after the call.
    pub fn new(runner: &str, device: &str, num_chunks: usize) -> Span {
        debug_span!(
            "call_chunks",
            runner = %runner,
            device = %device,
            num_chunks,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
