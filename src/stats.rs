// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Named statistics for runners and callers.
//!
//! Counters are lock-free atomics written by the executor and read on demand
//! by whoever samples them. Snapshots are point-in-time reads; two runners
//! sampling the same caller may see slightly different values.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter name -> value, as pulled by an external aggregator.
pub type NamedStats = BTreeMap<String, f64>;

/// Counters owned by one caller.
#[derive(Debug, Default)]
pub struct CallerCounters {
    batches_executed: AtomicU64,
    chunks_executed: AtomicU64,
    model_us: AtomicU64,
    decode_us: AtomicU64,
    queue_wait_us: AtomicU64,
    calls_rejected: AtomicU64,
    restarts: AtomicU64,
}

impl CallerCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, chunks: usize, queue_wait: Duration, model: Duration, decode: Duration) {
        self.batches_executed.fetch_add(1, Ordering::Relaxed);
        self.chunks_executed.fetch_add(chunks as u64, Ordering::Relaxed);
        self.queue_wait_us.fetch_add(queue_wait.as_micros() as u64, Ordering::Relaxed);
        self.model_us.fetch_add(model.as_micros() as u64, Ordering::Relaxed);
        self.decode_us.fetch_add(decode.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.calls_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn batches_executed(&self) -> u64 {
        self.batches_executed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> NamedStats {
        let ms = |c: &AtomicU64| c.load(Ordering::Relaxed) as f64 / 1000.0;
        let count = |c: &AtomicU64| c.load(Ordering::Relaxed) as f64;
        let mut stats = NamedStats::new();
        stats.insert("batches_executed".into(), count(&self.batches_executed));
        stats.insert("chunks_executed".into(), count(&self.chunks_executed));
        stats.insert("model_ms".into(), ms(&self.model_us));
        stats.insert("decode_ms".into(), ms(&self.decode_us));
        stats.insert("queue_wait_ms".into(), ms(&self.queue_wait_us));
        stats.insert("calls_rejected".into(), count(&self.calls_rejected));
        stats.insert("restarts".into(), count(&self.restarts));
        stats
    }
}

/// Prefix every key with `name.`, for aggregating several sources.
pub fn prefixed(name: &str, stats: &NamedStats) -> NamedStats {
    stats.iter().map(|(k, v)| (format!("{name}.{k}"), *v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_recorded_batches() {
        let c = CallerCounters::new();
        c.record_batch(4, Duration::from_micros(1500), Duration::from_millis(3), Duration::ZERO);
        c.record_batch(2, Duration::ZERO, Duration::from_millis(1), Duration::from_micros(500));
        c.record_rejection();

        let s = c.snapshot();
        assert_eq!(s["batches_executed"], 2.0);
        assert_eq!(s["chunks_executed"], 6.0);
        assert_eq!(s["model_ms"], 4.0);
        assert_eq!(s["decode_ms"], 0.5);
        assert_eq!(s["queue_wait_ms"], 1.5);
        assert_eq!(s["calls_rejected"], 1.0);
        assert_eq!(s["restarts"], 0.0);
    }

    #[test]
    fn prefixed_keys() {
        let mut s = NamedStats::new();
        s.insert("batches_called".into(), 3.0);
        let p = prefixed("ModelRunner_7", &s);
        assert_eq!(p["ModelRunner_7.batches_called"], 3.0);
    }
}
