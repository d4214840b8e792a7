// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Device identifiers and descriptions.
//!
//! A device is addressed by a short identifier string (`cpu`, `cuda:0`,
//! `metal`) and described by a [`DeviceInfo`] carrying its memory capacity.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Compute backend of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GpuBackend {
    /// NVIDIA CUDA backend
    Cuda,
    /// Apple Metal backend
    Metal,
    /// CPU fallback (no GPU)
    #[default]
    Cpu,
}

impl fmt::Display for GpuBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuBackend::Cuda => write!(f, "CUDA"),
            GpuBackend::Metal => write!(f, "Metal"),
            GpuBackend::Cpu => write!(f, "CPU"),
        }
    }
}

/// Parsed device identifier, e.g. `cuda:1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub backend: GpuBackend,
    pub index: usize,
}

impl DeviceId {
    pub fn cpu() -> Self {
        Self { backend: GpuBackend::Cpu, index: 0 }
    }

    pub fn cuda(index: usize) -> Self {
        Self { backend: GpuBackend::Cuda, index }
    }

    pub fn metal() -> Self {
        Self { backend: GpuBackend::Metal, index: 0 }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.backend {
            GpuBackend::Cpu => write!(f, "cpu"),
            GpuBackend::Metal => write!(f, "metal"),
            GpuBackend::Cuda => write!(f, "cuda:{}", self.index),
        }
    }
}

impl FromStr for DeviceId {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "cpu" => return Ok(Self::cpu()),
            "metal" | "mps" => return Ok(Self::metal()),
            "cuda" => return Ok(Self::cuda(0)),
            _ => {}
        }
        let index = normalized
            .strip_prefix("cuda:")
            .and_then(|idx| idx.parse::<usize>().ok())
            .ok_or_else(|| DeviceError::InvalidIdentifier(s.to_string()))?;
        Ok(Self::cuda(index))
    }
}

/// Device description known to a [`super::DeviceManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub id: DeviceId,
    /// Human-readable device name
    pub name: String,
    /// Total memory in bytes
    pub total_memory: u64,
}

impl DeviceInfo {
    pub fn new(id: DeviceId, name: impl Into<String>, total_memory: u64) -> Self {
        Self { id, name: name.into(), total_memory }
    }

    /// Host device with the given amount of usable memory.
    pub fn cpu(total_memory: u64) -> Self {
        Self::new(DeviceId::cpu(), "CPU", total_memory)
    }

    /// Memory a caller may reserve under the given fraction.
    pub fn budget_bytes(&self, memory_fraction: f32) -> u64 {
        (self.total_memory as f64 * f64::from(memory_fraction)).floor() as u64
    }
}

/// Device-layer errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("Invalid device identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device {device} is already claimed for exclusive access")]
    AlreadyClaimed { device: String },

    #[error("Device {device} is shared by {holders} caller(s); exclusive access refused")]
    InSharedUse { device: String, holders: usize },

    #[error("Out of device memory: required {required} bytes, available {available} bytes")]
    OutOfMemory { required: u64, available: u64 },

    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),
}
