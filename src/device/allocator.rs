// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Device memory accounting: allocator trait, budget allocator, RAII handles.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::gpu::DeviceError;

/// Identifies one live reservation within its allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AllocationId(u64);

/// Byte accounting against a device memory budget.
pub trait DeviceAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<AllocationId, DeviceError>;
    /// Return a reservation. Yields the bytes it held.
    fn release(&self, id: AllocationId) -> Result<usize, DeviceError>;
    fn allocated_bytes(&self) -> usize;
    /// Highest `allocated_bytes` seen so far.
    fn peak_bytes(&self) -> usize;
    fn capacity(&self) -> usize;
}

#[derive(Default)]
struct Ledger {
    live: HashMap<AllocationId, usize>,
    reserved: usize,
    peak: usize,
    next_id: u64,
}

/// Allocator with a fixed byte capacity. Each caller owns one, sized to
/// `floor(total_memory * memory_limit_fraction)`.
pub struct BudgetAllocator {
    capacity: usize,
    ledger: Mutex<Ledger>,
}

impl BudgetAllocator {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, ledger: Mutex::new(Ledger::default()) }
    }

    /// Reservations not yet released.
    pub fn live_count(&self) -> usize {
        self.ledger.lock().live.len()
    }
}

impl DeviceAllocator for BudgetAllocator {
    fn allocate(&self, size: usize) -> Result<AllocationId, DeviceError> {
        let mut ledger = self.ledger.lock();
        let available = self.capacity.saturating_sub(ledger.reserved);
        if size > available {
            return Err(DeviceError::OutOfMemory { required: size as u64, available: available as u64 });
        }
        ledger.next_id += 1;
        let id = AllocationId(ledger.next_id);
        ledger.live.insert(id, size);
        ledger.reserved += size;
        ledger.peak = ledger.peak.max(ledger.reserved);
        Ok(id)
    }

    fn release(&self, id: AllocationId) -> Result<usize, DeviceError> {
        let mut ledger = self.ledger.lock();
        let size = ledger
            .live
            .remove(&id)
            .ok_or_else(|| DeviceError::AllocationFailed(format!("allocation {} not live", id.0)))?;
        ledger.reserved -= size;
        Ok(size)
    }

    fn allocated_bytes(&self) -> usize {
        self.ledger.lock().reserved
    }

    fn peak_bytes(&self) -> usize {
        self.ledger.lock().peak
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Device memory reservation, returned to its allocator on drop.
pub struct DeviceMemory {
    size: usize,
    id: AllocationId,
    allocator: Arc<dyn DeviceAllocator>,
}

impl DeviceMemory {
    pub fn reserve(allocator: &Arc<dyn DeviceAllocator>, size: usize) -> Result<Self, DeviceError> {
        let id = allocator.allocate(size)?;
        Ok(Self { size, id, allocator: Arc::clone(allocator) })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory").field("size", &self.size).field("id", &self.id.0).finish()
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        if let Err(e) = self.allocator.release(self.id) {
            tracing::warn!(error = %e, "device memory release failed");
        }
    }
}

#[cfg(test)]
#[path = "allocator_tests.rs"]
mod tests;
