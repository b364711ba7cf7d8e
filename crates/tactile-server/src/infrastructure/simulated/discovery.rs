//! Discovery back-end that reports a fixed set of [`SimulatedDevice`]s.
//!
//! On `start_scanning` every configured device is reported as found.  By
//! default the back-end then finishes on its own, like a BLE scan with a
//! timeout; with `finishing_immediately(false)` it keeps scanning until
//! `stop_scanning` is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tactile_core::DeviceError;
use tokio::sync::mpsc;
use tracing::debug;

use super::device::SimulatedDevice;
use crate::application::device::DeviceAdapter;
use crate::application::discovery::{DeviceEvent, DiscoveryBackend};
use crate::infrastructure::storage::config::SimulatedDeviceEntry;

pub struct SimulatedDiscovery {
    name: String,
    devices: Mutex<Vec<Arc<SimulatedDevice>>>,
    finish_immediately: bool,
    scanning: AtomicBool,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl SimulatedDiscovery {
    pub fn new(name: impl Into<String>, events: mpsc::UnboundedSender<DeviceEvent>) -> Self {
        Self {
            name: name.into(),
            devices: Mutex::new(Vec::new()),
            finish_immediately: true,
            scanning: AtomicBool::new(false),
            events,
        }
    }

    /// Builds a back-end from the `[[simulated_devices]]` config entries.
    pub fn from_config(
        entries: &[SimulatedDeviceEntry],
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        let discovery = Self::new("simulated", events);
        for entry in entries {
            let mut device = SimulatedDevice::new(entry.name.clone(), entry.identifier.clone())
                .with_vibrators(entry.vibrators)
                .with_rotators(entry.rotators)
                .with_linear_actuators(entry.linear_actuators);
            if let Some(level) = entry.battery {
                device = device.with_battery(level);
            }
            discovery.add_device(Arc::new(device));
        }
        discovery
    }

    pub fn with_device(self, device: Arc<SimulatedDevice>) -> Self {
        self.add_device(device);
        self
    }

    /// `false` keeps the scan running until `stop_scanning`.
    pub fn finishing_immediately(mut self, finish: bool) -> Self {
        self.finish_immediately = finish;
        self
    }

    pub fn add_device(&self, device: Arc<SimulatedDevice>) {
        self.lock_devices().push(device);
    }

    /// Simulates `identifier` going out of range.
    pub fn remove_device(&self, identifier: &str) {
        self.lock_devices().retain(|d| d.identifier() != identifier);
        let _ = self.events.send(DeviceEvent::DeviceRemoved {
            identifier: identifier.to_string(),
        });
    }

    fn lock_devices(&self) -> std::sync::MutexGuard<'_, Vec<Arc<SimulatedDevice>>> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(&self) {
        if self.scanning.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(DeviceEvent::ScanningFinished {
                backend: self.name.clone(),
            });
        }
    }
}

#[async_trait]
impl DiscoveryBackend for SimulatedDiscovery {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn start_scanning(&self) -> Result<(), DeviceError> {
        self.scanning.store(true, Ordering::SeqCst);
        let devices = self.lock_devices().clone();
        debug!("{} reporting {} device(s)", self.name, devices.len());
        for device in devices {
            let adapter: Arc<dyn DeviceAdapter> = device;
            let _ = self.events.send(DeviceEvent::DeviceFound(adapter));
        }
        if self.finish_immediately {
            self.finish();
        }
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<(), DeviceError> {
        self.finish();
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }
}
