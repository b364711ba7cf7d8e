//! Simulated hardware: an in-memory device adapter and a discovery back-end
//! that "finds" a configured set of them.
//!
//! Used by the test suites and by the server binary's `[[simulated_devices]]`
//! configuration, so the whole protocol can be exercised without Bluetooth,
//! serial or HID hardware.

pub mod device;
pub mod discovery;

pub use device::SimulatedDevice;
pub use discovery::SimulatedDiscovery;
