//! Discovery back-end contract.
//!
//! A back-end (Bluetooth LE, serial, HID, a simulator) is told to start and
//! stop scanning.  Everything it finds is pushed as a [`DeviceEvent`] onto the
//! channel it was built with; the device manager consumes that channel.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tactile_core::DeviceError;

use super::device::DeviceAdapter;

/// Event pushed by a discovery back-end.
#[derive(Clone)]
pub enum DeviceEvent {
    /// A device was found and is ready to be initialized.
    DeviceFound(Arc<dyn DeviceAdapter>),
    /// A previously found device went away.
    DeviceRemoved { identifier: String },
    /// The named back-end stopped scanning.
    ScanningFinished { backend: String },
}

impl fmt::Debug for DeviceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceEvent::DeviceFound(adapter) => f
                .debug_struct("DeviceFound")
                .field("name", &adapter.name())
                .field("identifier", &adapter.identifier())
                .finish(),
            DeviceEvent::DeviceRemoved { identifier } => f
                .debug_struct("DeviceRemoved")
                .field("identifier", identifier)
                .finish(),
            DeviceEvent::ScanningFinished { backend } => f
                .debug_struct("ScanningFinished")
                .field("backend", backend)
                .finish(),
        }
    }
}

/// A source of devices.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Name used in logs and in `ScanningFinished` events.
    fn name(&self) -> String;

    async fn start_scanning(&self) -> Result<(), DeviceError>;

    async fn stop_scanning(&self) -> Result<(), DeviceError>;

    /// `true` while a scan is in progress.
    fn is_scanning(&self) -> bool;
}
