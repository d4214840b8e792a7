// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Device layer: identifiers, memory budgets, ownership claims and streams.

pub mod allocator;
mod gpu;
mod manager;
mod stream;

pub use allocator::{AllocationId, BudgetAllocator, DeviceAllocator, DeviceMemory};
pub use gpu::{DeviceError, DeviceId, DeviceInfo, GpuBackend};
pub use manager::{ClaimMode, DeviceClaim, DeviceManager};
pub use stream::ExecutionContext;
