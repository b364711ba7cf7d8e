//! Application layer of the Tactile client.
//!
//! - **`request_tracker`** – Assigns request ids and matches replies to the
//!   callers awaiting them.
//! - **`client`** – The connected client: handshake, keep-alive, typed
//!   request helpers and the unsolicited event stream.

pub mod client;
pub mod request_tracker;
