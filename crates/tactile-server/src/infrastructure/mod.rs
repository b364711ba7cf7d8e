//! Infrastructure layer of the Tactile server.
//!
//! Contains the outward-facing adapters: simulated hardware, the TOML
//! configuration store and the WebSocket transport.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `tactile_core`, but MUST NOT be imported by the `application` layer.

pub mod simulated;
pub mod storage;
pub mod transport;
