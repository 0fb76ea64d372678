//! Process-wide device table.
//!
//! The table exists from the first registration until the last device is
//! removed. All lookups go through the registry lock.

use std::sync::Arc;

use parking_lot::{Mutex, const_mutex};
use tracing::{debug, info, warn};

use crate::api::Result;
use crate::config::ShimFlags;
use crate::device::NetDevice;
use crate::driver::NetDriver;
use crate::errors::Error;
use crate::host::HostStack;

#[derive(Debug, Default)]
struct Table {
    devices: Vec<Arc<NetDevice>>,
    panic: bool,
}

impl Table {
    fn find(&self, name: &str) -> Option<usize> {
        self.devices.iter().position(|d| d.name() == name)
    }

    /// Expands a `%d` template to the lowest unused unit number.
    fn allocate_name(&self, template: &str) -> Result<String> {
        if !template.contains("%d") {
            return match self.find(template) {
                Some(_) => Err(Error::NameInUse(template.to_string())),
                None => Ok(template.to_string()),
            };
        }
        (0..=self.devices.len())
            .map(|unit| template.replacen("%d", &unit.to_string(), 1))
            .find(|name| self.find(name).is_none())
            .ok_or(Error::Failure("no free device name"))
    }
}

pub struct Registry {
    table: Mutex<Option<Table>>,
}

static GLOBAL: Registry = Registry::new();

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            table: const_mutex(None),
        }
    }

    pub fn global() -> &'static Registry {
        &GLOBAL
    }

    pub fn is_initialized(&self) -> bool {
        self.table.lock().is_some()
    }

    /// Creates a device for `driver` under the name template in `flags`.
    pub fn register(
        &self,
        driver: Arc<dyn NetDriver>,
        host: Arc<dyn HostStack>,
        flags: ShimFlags,
    ) -> Result<Arc<NetDevice>> {
        let mut guard = self.table.lock();
        let table = guard.get_or_insert_with(|| {
            debug!("device registry initialized");
            Table::default()
        });
        let name = match table.allocate_name(&flags.name) {
            Ok(name) => name,
            Err(err) => {
                if table.devices.is_empty() {
                    *guard = None;
                }
                return Err(err);
            }
        };
        let dev = NetDevice::new(name, driver, host, flags);
        dev.set_panic_mode(table.panic);
        table.devices.push(dev.clone());
        info!(dev = %dev.name(), "device registered");
        Ok(dev)
    }

    /// Closes and removes a device. Removing the last one tears the
    /// registry down.
    pub fn unregister(&self, name: &str) -> Result<Arc<NetDevice>> {
        let mut guard = self.table.lock();
        let table = guard
            .as_mut()
            .ok_or_else(|| Error::NoDevice(name.to_string()))?;
        let pos = table
            .find(name)
            .ok_or_else(|| Error::NoDevice(name.to_string()))?;
        let dev = table.devices.remove(pos);
        if table.devices.is_empty() {
            *guard = None;
            debug!("device registry torn down");
        }
        drop(guard);
        if let Err(err) = dev.close() {
            warn!(dev = %name, %err, "close on unregister failed");
        }
        info!(dev = %name, "device unregistered");
        Ok(dev)
    }

    pub fn get(&self, name: &str) -> Option<Arc<NetDevice>> {
        let guard = self.table.lock();
        let table = guard.as_ref()?;
        table.find(name).map(|i| table.devices[i].clone())
    }

    pub fn devices(&self) -> Vec<Arc<NetDevice>> {
        self.table
            .lock()
            .as_ref()
            .map(|t| t.devices.clone())
            .unwrap_or_default()
    }

    /// Switches every device to the panic-time paths.
    pub fn enter_panic_mode(&self) {
        self.set_panic(true);
    }

    pub fn leave_panic_mode(&self) {
        self.set_panic(false);
    }

    fn set_panic(&self, on: bool) {
        if let Some(table) = self.table.lock().as_mut() {
            table.panic = on;
            for dev in &table.devices {
                dev.set_panic_mode(on);
            }
        }
    }
}
