// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Caller error types.
//!
//! Every error names the device it came from. A failure of one caller never
//! affects another.

use thiserror::Error;

use crate::device::DeviceError;

/// Errors surfaced by callers and runners.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallerError {
    /// Invalid model, device or shape at construction. Fatal for the caller.
    #[error("Configuration error on {device}: {reason}")]
    Config { device: String, reason: String },

    /// Memory budget exhausted. The pipeline may retry with a smaller batch.
    #[error("Resource exhausted on {device}: requested {requested} bytes, available {available} bytes")]
    ResourceExhausted { device: String, requested: u64, available: u64 },

    /// Call issued after `terminate()`. Expected during shutdown.
    #[error("Caller on {device} is terminated")]
    Terminated { device: String },

    /// Shape or length mismatch. A programmer error.
    #[error("Invalid input on {device}: {reason}")]
    InvalidInput { device: String, reason: String },

    /// Forward pass or executor failure.
    #[error("Device failure on {device}: {reason}")]
    Device { device: String, reason: String },
}

impl CallerError {
    pub(crate) fn config(device: &str, reason: impl Into<String>) -> Self {
        Self::Config { device: device.to_string(), reason: reason.into() }
    }

    pub(crate) fn invalid(device: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput { device: device.to_string(), reason: reason.into() }
    }

    pub(crate) fn terminated(device: &str) -> Self {
        Self::Terminated { device: device.to_string() }
    }

    pub(crate) fn device_failure(device: &str, reason: impl Into<String>) -> Self {
        Self::Device { device: device.to_string(), reason: reason.into() }
    }

    /// Out-of-memory becomes `ResourceExhausted`; anything else is a
    /// configuration problem.
    pub(crate) fn from_device(device: &str, err: DeviceError) -> Self {
        match err {
            DeviceError::OutOfMemory { required, available } => Self::ResourceExhausted {
                device: device.to_string(),
                requested: required,
                available,
            },
            other => Self::config(device, other.to_string()),
        }
    }

    /// The device this error came from.
    pub fn device(&self) -> &str {
        match self {
            Self::Config { device, .. }
            | Self::ResourceExhausted { device, .. }
            | Self::Terminated { device }
            | Self::InvalidInput { device, .. }
            | Self::Device { device, .. } => device,
        }
    }

    /// True if retrying with a smaller batch may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. })
    }

    /// True if the affected unit should abort.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::InvalidInput { .. })
    }

    /// True for the expected shutdown signal.
    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_maps_to_resource_exhausted() {
        let err = CallerError::from_device(
            "cuda:0",
            DeviceError::OutOfMemory { required: 10, available: 4 },
        );
        assert_eq!(
            err,
            CallerError::ResourceExhausted {
                device: "cuda:0".into(),
                requested: 10,
                available: 4
            }
        );
        assert!(err.is_retryable());
        assert!(!err.is_fatal());
    }

    #[test]
    fn other_device_errors_are_config() {
        let err = CallerError::from_device("cuda:1", DeviceError::DeviceNotFound("cuda:1".into()));
        assert!(err.is_fatal());
        assert_eq!(err.device(), "cuda:1");
    }

    #[test]
    fn terminated_is_not_fatal() {
        let err = CallerError::terminated("cpu");
        assert!(err.is_terminated());
        assert!(!err.is_fatal());
        assert!(!err.is_retryable());
    }
}
