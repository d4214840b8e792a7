// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! basecall-runtime
//!
//! A batched inference engine that turns fixed-size chunks of raw signal into
//! decoded base sequences on a compute device.
//!
//! # Architecture
//!
//! - **Caller**: one per device. Owns the model weights, the memory budget and
//!   a FIFO execution queue drained by a single executor thread.
//! - **ModelRunner**: one per worker thread. Owns input/output batch buffers
//!   and submits batches to its shared caller.
//! - **Decoder**: turns per-step scores into sequence, qualities and moves.
//! - **DeviceManager**: registry of devices and shared/exclusive claims.
//!
//! ```no_run
//! use std::sync::Arc;
//! use basecall_runtime::{Caller, CallerConfig, DeviceManager, ModelRunner};
//! use basecall_runtime::config::default_model_config;
//!
//! let devices = Arc::new(DeviceManager::detect(1 << 30));
//! let config = CallerConfig { batch_size: 4, ..Default::default() };
//! let caller = Caller::with_reference_model(Arc::new(default_model_config()), config, &devices)?;
//!
//! let mut runner = ModelRunner::new(Arc::clone(&caller), 0)?;
//! runner.accept_chunk(0, &vec![0.0; runner.chunk_size()])?;
//! let decoded = runner.call_chunks(1)?;
//! assert_eq!(decoded.len(), 1);
//! caller.terminate();
//! # Ok::<(), basecall_runtime::CallerError>(())
//! ```

pub mod batch;
pub mod caller;
pub mod config;
pub mod decode;
pub mod device;
pub mod model;
pub mod pipeline;
pub mod runner;
pub mod stats;
pub mod telemetry;

pub use batch::{InputBatch, OutputBatch, SlotError};
pub use caller::{Caller, CallerConfig, CallerError, CallerState};
pub use decode::{DecodedChunk, Decoder, GreedyDecoder};
pub use device::{ClaimMode, DeviceId, DeviceInfo, DeviceManager, ExecutionContext};
pub use model::{BasecallModel, BatchDims, CpuModelLoader, ModelConfig, ModelError, ModelLoader};
pub use pipeline::{BatchError, ChunkBatcher};
pub use runner::{ModelRunner, RunnerStats};
pub use stats::NamedStats;
