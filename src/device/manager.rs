// Copyright 2024-2026 basecall-runtime Contributors
// Licensed under the Apache License, Version 2.0

//! Device Manager - known devices and their ownership claims.
//!
//! The manager is an explicit object owned by the pipeline. Every caller
//! registers a claim on its device; exclusive claims fail fast when the
//! device is already in use.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::gpu::{DeviceError, DeviceId, DeviceInfo};

/// How a caller holds its device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimMode {
    /// Cooperate with other holders through the device's own arbitration.
    Shared,
    /// Sole owner for the session.
    Exclusive,
}

#[derive(Debug)]
struct ClaimState {
    exclusive: bool,
    holders: usize,
}

/// Registry of devices and the claims held on them.
#[derive(Debug)]
pub struct DeviceManager {
    devices: Vec<DeviceInfo>,
    claims: DashMap<DeviceId, ClaimState>,
}

impl DeviceManager {
    /// Create a manager over an explicit device list.
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices, claims: DashMap::new() }
    }

    /// Host-only manager. Accelerators are registered with [`Self::with_device`].
    pub fn detect(cpu_memory: u64) -> Self {
        Self::new(vec![DeviceInfo::cpu(cpu_memory)])
    }

    /// Register an additional device, replacing any entry with the same id.
    pub fn with_device(mut self, info: DeviceInfo) -> Self {
        self.devices.retain(|d| d.id != info.id);
        self.devices.push(info);
        self
    }

    /// All known devices.
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Resolve a device identifier string to a known device.
    pub fn resolve(&self, identifier: &str) -> Result<DeviceInfo, DeviceError> {
        let id: DeviceId = identifier.parse()?;
        self.devices
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| DeviceError::DeviceNotFound(id.to_string()))
    }

    /// Claim a device. The claim is released when the returned guard drops.
    pub fn claim(self: &Arc<Self>, id: &DeviceId, mode: ClaimMode) -> Result<DeviceClaim, DeviceError> {
        if !self.devices.iter().any(|d| &d.id == id) {
            return Err(DeviceError::DeviceNotFound(id.to_string()));
        }
        match self.claims.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get_mut();
                if state.exclusive {
                    return Err(DeviceError::AlreadyClaimed { device: id.to_string() });
                }
                if mode == ClaimMode::Exclusive {
                    return Err(DeviceError::InSharedUse {
                        device: id.to_string(),
                        holders: state.holders,
                    });
                }
                state.holders += 1;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ClaimState {
                    exclusive: mode == ClaimMode::Exclusive,
                    holders: 1,
                });
            }
        }
        tracing::debug!(device = %id, ?mode, "device claimed");
        Ok(DeviceClaim { manager: Arc::clone(self), device: id.clone(), mode })
    }

    /// Number of live claims on a device.
    pub fn holders(&self, id: &DeviceId) -> usize {
        self.claims.get(id).map(|s| s.holders).unwrap_or(0)
    }

    /// True if the device is held exclusively.
    pub fn is_exclusive(&self, id: &DeviceId) -> bool {
        self.claims.get(id).map(|s| s.exclusive).unwrap_or(false)
    }

    fn release(&self, id: &DeviceId) {
        let now_empty = match self.claims.get_mut(id) {
            Some(mut state) => {
                state.holders = state.holders.saturating_sub(1);
                state.holders == 0
            }
            None => false,
        };
        if now_empty {
            self.claims.remove_if(id, |_, s| s.holders == 0);
        }
    }
}

/// RAII guard for a device claim.
#[derive(Debug)]
pub struct DeviceClaim {
    manager: Arc<DeviceManager>,
    device: DeviceId,
    mode: ClaimMode,
}

impl DeviceClaim {
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    pub fn mode(&self) -> ClaimMode {
        self.mode
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        self.manager.release(&self.device);
        tracing::debug!(device = %self.device, "device claim released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<DeviceManager> {
        Arc::new(
            DeviceManager::detect(1 << 30)
                .with_device(DeviceInfo::new(DeviceId::cuda(0), "test-gpu", 1 << 30)),
        )
    }

    #[test]
    fn resolve_known_and_unknown_devices() {
        let m = manager();
        assert_eq!(m.resolve("cuda:0").unwrap().name, "test-gpu");
        assert_eq!(m.resolve("CPU").unwrap().id, DeviceId::cpu());
        assert!(matches!(m.resolve("cuda:3"), Err(DeviceError::DeviceNotFound(_))));
        assert!(matches!(m.resolve("tpu"), Err(DeviceError::InvalidIdentifier(_))));
    }

    #[test]
    fn exclusive_claim_blocks_second_claim() {
        let m = manager();
        let id = DeviceId::cuda(0);
        let _claim = m.claim(&id, ClaimMode::Exclusive).unwrap();
        assert!(matches!(
            m.claim(&id, ClaimMode::Exclusive),
            Err(DeviceError::AlreadyClaimed { .. })
        ));
        assert!(matches!(
            m.claim(&id, ClaimMode::Shared),
            Err(DeviceError::AlreadyClaimed { .. })
        ));
    }

    #[test]
    fn exclusive_refused_while_shared() {
        let m = manager();
        let id = DeviceId::cuda(0);
        let _a = m.claim(&id, ClaimMode::Shared).unwrap();
        let _b = m.claim(&id, ClaimMode::Shared).unwrap();
        assert_eq!(m.holders(&id), 2);
        assert_eq!(
            m.claim(&id, ClaimMode::Exclusive).unwrap_err(),
            DeviceError::InSharedUse { device: "cuda:0".to_string(), holders: 2 }
        );
    }

    #[test]
    fn with_device_replaces_same_id() {
        let m = DeviceManager::detect(1 << 30)
            .with_device(DeviceInfo::new(DeviceId::cuda(0), "old-gpu", 1 << 30))
            .with_device(DeviceInfo::new(DeviceId::cuda(0), "new-gpu", 2 << 30));
        let names: Vec<_> = m.devices().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"new-gpu"));
        assert!(!names.contains(&"old-gpu"));
    }

    #[test]
    fn claim_reports_device_and_mode() {
        let m = manager();
        let claim = m.claim(&DeviceId::cpu(), ClaimMode::Shared).unwrap();
        assert_eq!(claim.device(), &DeviceId::cpu());
        assert_eq!(claim.mode(), ClaimMode::Shared);
        assert!(!m.is_exclusive(&DeviceId::cpu()));
    }

    #[test]
    fn dropping_claim_frees_device() {
        let m = manager();
        let id = DeviceId::cuda(0);
        let claim = m.claim(&id, ClaimMode::Exclusive).unwrap();
        assert!(m.is_exclusive(&id));
        drop(claim);
        assert_eq!(m.holders(&id), 0);
        assert!(m.claim(&id, ClaimMode::Exclusive).is_ok());
    }
}
