//! Collaborator store interfaces.
//!
//! The host application decides where devices and filter rules live; the
//! session core only talks to these traits. In-memory implementations are
//! provided for hosts without persistence and for tests.

use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::filter::FilterRule;
use crate::model::Device;

/// Persistent device records keyed by uuid.
pub trait DeviceStore: Send + Sync {
    fn load(&self) -> Result<Vec<Device>>;
    /// Insert or replace by uuid.
    fn save(&self, device: &Device) -> Result<()>;
    fn delete(&self, uuid: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Persistent filter rule configuration.
pub trait FilterConfigStore: Send + Sync {
    /// An empty list means "never saved"; callers fall back to defaults.
    fn load(&self) -> Result<Vec<FilterRule>>;
    fn save(&self, rules: &[FilterRule]) -> Result<()>;
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Store("store lock poisoned".into()))
}

/// Device store held in memory. Preserves insertion order on load.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<Vec<Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            devices: Mutex::new(devices),
        }
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn load(&self) -> Result<Vec<Device>> {
        Ok(lock(&self.devices)?.clone())
    }

    fn save(&self, device: &Device) -> Result<()> {
        let mut devices = lock(&self.devices)?;
        match devices.iter_mut().find(|d| d.uuid == device.uuid) {
            Some(existing) => *existing = device.clone(),
            None => devices.push(device.clone()),
        }
        Ok(())
    }

    fn delete(&self, uuid: &str) -> Result<()> {
        lock(&self.devices)?.retain(|d| d.uuid != uuid);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        lock(&self.devices)?.clear();
        Ok(())
    }
}

/// Filter-config store held in memory.
#[derive(Debug, Default)]
pub struct MemoryFilterStore {
    rules: Mutex<Vec<FilterRule>>,
}

impl MemoryFilterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FilterConfigStore for MemoryFilterStore {
    fn load(&self) -> Result<Vec<FilterRule>> {
        Ok(lock(&self.rules)?.clone())
    }

    fn save(&self, rules: &[FilterRule]) -> Result<()> {
        *lock(&self.rules)? = rules.to_vec();
        Ok(())
    }
}
