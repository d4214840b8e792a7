// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Metrics facade emission. Recorders are installed by the embedding
//! application; without one these calls are no-ops.

use std::time::Duration;

pub fn record_batch(device: &str, chunks: usize, model: Duration, decode: Duration) {
    let device = device.to_string();
    metrics::counter!("basecall_batches_total", "device" => device.clone()).increment(1);
    metrics::counter!("basecall_chunks_total", "device" => device.clone()).increment(chunks as u64);
    metrics::histogram!("basecall_model_ms", "device" => device.clone())
        .record(model.as_secs_f64() * 1000.0);
    metrics::histogram!("basecall_decode_ms", "device" => device)
        .record(decode.as_secs_f64() * 1000.0);
}

pub fn record_rejection(device: &str) {
    metrics::counter!("basecall_rejected_total", "device" => device.to_string()).increment(1);
}

pub fn record_failure(device: &str) {
    metrics::counter!("basecall_failed_total", "device" => device.to_string()).increment(1);
}
