// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Execution contexts (device streams) handed explicitly to every call.

use super::gpu::DeviceId;

/// Stream handle bound to one device.
///
/// Each runner owns one context and passes it to the caller with every
/// batch; the context is never looked up from thread-local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    id: u64,
    device: DeviceId,
}

impl ExecutionContext {
    pub(crate) fn new(id: u64, device: DeviceId) -> Self {
        Self { id, device }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &DeviceId {
        &self.device
    }
}
