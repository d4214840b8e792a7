// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Telemetry: structured logging, spans and metrics facade emission.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{record_batch, record_failure, record_rejection};
pub use spans::{BatchSpan, SpanExt};
