//! Application layer of the Tactile server.
//!
//! # What lives here? (for beginners)
//!
//! The application layer holds the protocol rules.  It knows nothing about
//! sockets, files or real hardware; it talks to devices and discovery
//! back-ends only through the traits declared in [`device`] and
//! [`discovery`], so the infrastructure layer can plug in anything from a
//! Bluetooth stack to the in-memory simulators used by the tests.
//!
//! # Sub-modules
//!
//! - **`session`** – The per-client state machine: handshake gating, the
//!   keep-alive ping timer, and routing of every inbound request.
//!
//! - **`device_manager`** – The device registry: index assignment,
//!   deduplication, removal, capability filtering and command routing.
//!
//! - **`scan`** – Fans scan start/stop out to every discovery back-end and
//!   emits one aggregate `ScanningFinished` per scan cycle.
//!
//! - **`device`** / **`discovery`** – The adapter and back-end contracts plus
//!   the central validation of generic actuator commands.
//!
//! - **`log`** – The client-visible log relay (`RequestLog` / `Log`).

pub mod device;
pub mod device_manager;
pub mod discovery;
pub mod log;
pub mod scan;
pub mod session;
