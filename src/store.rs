//! In-memory resource values shared between port threads and command
//! handlers: device name → resource name → raw bytes.
//!
//! Values are copied in and out, so a caller never holds a view into the
//! store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use snafu::{OptionExt, Snafu};

#[derive(Debug, PartialEq, Eq, Snafu)]
pub enum Error {
    #[snafu(display("Device {} not found", device))]
    DeviceNotFound { device: String },
    #[snafu(display("Resource {} not found on device {}", resource, device))]
    ResourceNotFound { device: String, resource: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    /// How the outer layers interpret `value`, e.g. "raw" or "uint16".
    pub data_type: String,
    pub value: Vec<u8>,
}

type Devices = HashMap<String, HashMap<String, Resource>>;

#[derive(Debug, Default)]
pub struct ResourceStore {
    devices: RwLock<Devices>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Devices> {
        self.devices.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Devices> {
        self.devices.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a resource, replacing any previous one with the same name.
    pub fn add_resource(&self, device: &str, resource: &str, data_type: &str, value: &[u8]) {
        self.write().entry(device.to_owned()).or_default().insert(
            resource.to_owned(),
            Resource {
                name: resource.to_owned(),
                data_type: data_type.to_owned(),
                value: value.to_vec(),
            },
        );
    }

    pub fn get_resource(&self, device: &str, resource: &str) -> Result<Resource, Error> {
        let devices = self.read();
        let resources = devices
            .get(device)
            .context(DeviceNotFoundSnafu { device })?;
        resources
            .get(resource)
            .cloned()
            .context(ResourceNotFoundSnafu { device, resource })
    }

    /// Replace the value of an existing resource, keeping its data type.
    pub fn update_value(&self, device: &str, resource: &str, value: &[u8]) -> Result<(), Error> {
        let mut devices = self.write();
        let entry = devices
            .get_mut(device)
            .context(DeviceNotFoundSnafu { device })?
            .get_mut(resource)
            .context(ResourceNotFoundSnafu { device, resource })?;
        entry.value = value.to_vec();
        Ok(())
    }

    pub fn delete_device(&self, device: &str) {
        self.write().remove(device);
    }

    pub fn clear(&self) {
        self.write().clear();
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }
}
