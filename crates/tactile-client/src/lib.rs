//! tactile-client library entry point.
//!
//! # What does the client do? (for beginners)
//!
//! A client connects to a Tactile server, performs the `RequestServerInfo`
//! handshake, and then sends requests such as `StartScanning` or
//! `VibrateCmd`.  Every request carries a fresh nonzero id; the server's
//! reply carries the same id, which is how [`RequestTracker`] hands each
//! reply back to the caller that is awaiting it.  Messages with id 0 are
//! server-initiated events (a device appeared, a scan finished) and are
//! delivered on a separate [`ClientEvent`] channel.
//!
//! If the server announces a nonzero `MaxPingTime`, the client pings it at
//! half that interval for as long as the connection is up.

/// Application layer: request correlation and the protocol client.
pub mod application;

/// Infrastructure layer: transports that carry text frames.
pub mod infrastructure;

pub use application::client::{ClientError, ClientEvent, ClientOptions, ProtocolClient};
pub use application::request_tracker::{PendingReply, RequestError, RequestTracker};
pub use infrastructure::connector::{Connection, Connector, ConnectorError};
