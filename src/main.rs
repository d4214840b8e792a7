// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! basecall-bench: drives one caller with N runner threads over synthetic
//! signal and prints merged statistics as JSON.
//!
//! ## CLI Subcommands
//!
//! - `basecall-bench` or `basecall-bench run [BATCHES]` - Run the benchmark
//! - `basecall-bench config` - Print the effective configuration
//! - `basecall-bench version` - Print the version

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use basecall_runtime::config::{self as bc_config, EnvConfig};
use basecall_runtime::stats::{prefixed, NamedStats};
use basecall_runtime::telemetry::init_logging;
use basecall_runtime::{BatchError, Caller, CallerError, ChunkBatcher, DeviceManager, ModelRunner};

const DEFAULT_BATCHES_PER_RUNNER: usize = 16;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("run");

    match command {
        "run" | "" => {
            let batches = match args.get(2).map(|s| s.parse::<usize>()) {
                None => DEFAULT_BATCHES_PER_RUNNER,
                Some(Ok(n)) if n > 0 => n,
                Some(_) => {
                    eprintln!("BATCHES must be a positive integer");
                    return ExitCode::FAILURE;
                }
            };
            let config = bc_config::load();
            if let Err(e) = init_logging(&config.log) {
                eprintln!("Logging init failed: {}", e);
                return ExitCode::FAILURE;
            }
            match run_bench(&config, batches) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Benchmark failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "config" => {
            let effective = bc_config::load().effective_config();
            match serde_json::to_string_pretty(&effective) {
                Ok(json) => {
                    println!("{}", json);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("Failed to serialize config: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        "version" | "--version" | "-V" => {
            println!("basecall-bench {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!("Usage: basecall-bench [run [BATCHES] | config | version | help]");
    eprintln!();
    eprintln!("Configuration is read from BASECALL_* environment variables.");
    eprintln!("Run `basecall-bench config` to see the effective values.");
}

#[derive(Debug, thiserror::Error)]
enum BenchError {
    #[error(transparent)]
    Config(#[from] bc_config::ConfigError),
    #[error(transparent)]
    Caller(#[from] CallerError),
    #[error(transparent)]
    Batch(#[from] BatchError<usize>),
    #[error("worker failed: {0}")]
    Worker(String),
}

fn run_bench(config: &EnvConfig, batches: usize) -> Result<(), BenchError> {
    let model_config = Arc::new(config.model_config()?);
    let devices = Arc::new(DeviceManager::detect(config.cpu_memory));
    let caller = Caller::with_reference_model(model_config, config.to_caller_config(), &devices)?;

    let mut handles = Vec::with_capacity(config.runners);
    let mut sources = Vec::with_capacity(config.runners);
    let start = Instant::now();

    for worker in 0..config.runners {
        let runner = ModelRunner::new(Arc::clone(&caller), 0)?;
        sources.push(runner.stats_handle());
        let max_retries = config.max_retries;
        let handle = thread::Builder::new()
            .name(format!("runner-{worker}"))
            .spawn(move || drive_runner(runner, worker as u64, batches, max_retries))
            .map_err(|e| BenchError::Worker(e.to_string()))?;
        handles.push(handle);
    }

    let mut total_chunks = 0usize;
    for handle in handles {
        total_chunks += handle
            .join()
            .map_err(|_| BenchError::Worker("runner thread panicked".into()))??;
    }
    let elapsed = start.elapsed();
    caller.terminate();

    let mut stats = NamedStats::new();
    for source in &sources {
        stats.extend(prefixed(source.name(), &source.sample_stats()));
    }
    stats.insert("bench.chunks".into(), total_chunks as f64);
    stats.insert("bench.elapsed_ms".into(), elapsed.as_secs_f64() * 1000.0);
    stats.insert(
        "bench.chunks_per_sec".into(),
        total_chunks as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
    );

    match serde_json::to_string_pretty(&stats) {
        Ok(json) => println!("{}", json),
        Err(e) => return Err(BenchError::Worker(e.to_string())),
    }
    Ok(())
}

/// Push `batches` full batches of random signal through one runner.
fn drive_runner(runner: ModelRunner, seed: u64, batches: usize, max_retries: u32) -> Result<usize, BenchError> {
    let chunk_len = runner.chunk_size() * runner.config().channels;
    let batch_size = runner.batch_size();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut batcher = ChunkBatcher::new(runner).with_max_retries(max_retries);
    let mut decoded = 0;

    for id in 0..batches * batch_size {
        let chunk: Vec<f32> = (0..chunk_len).map(|_| rng.gen_range(-1.0f32..1.0)).collect();
        decoded += batcher.push(id, chunk)?.len();
    }
    decoded += batcher.flush()?.len();
    Ok(decoded)
}
