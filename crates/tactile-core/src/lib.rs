//! # tactile-core
//!
//! Shared library for the Tactile device-control protocol containing the
//! message model, the JSON wire codec, the structural schema and the error
//! taxonomy used on both sides of a connection.
//!
//! This crate is used by both the server and client crates.  It has zero
//! dependencies on async runtimes, sockets or hardware.
//!
//! # Architecture overview (for beginners)
//!
//! A Tactile *server* owns a set of hardware devices (vibrators, rotators,
//! linear actuators) found by pluggable discovery back-ends.  A single
//! *client* connects over some transport, performs a handshake, and then
//! sends generic commands such as "vibrate feature 0 at 50 %".  The server
//! routes those commands to the right device and pushes lifecycle events
//! (device added/removed, scanning finished, log lines) back to the client.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How messages travel on the wire.  A frame is a JSON
//!   array of single-key objects, e.g. `[{"Ping":{"Id":4}}]`.  Messages are
//!   versioned: newer messages are downgraded for older clients on encode.
//!
//! - **`error`** – The error taxonomy (unknown / init / ping / message /
//!   device) and its mapping onto the `Error` wire message.

pub mod error;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `tactile_core::Message` instead of `tactile_core::protocol::messages::Message`.
pub use error::{DeviceError, DeviceFailure, HandshakeError, MessageError, ProtocolError};
pub use protocol::codec::{decode_messages, encode_message, encode_messages, DecodeError};
pub use protocol::messages::{ErrorCode, Message, MessageVersion, SERVER_MESSAGE_ID};
