//! Connector contract: how the client reaches a server.
//!
//! A connector yields a [`Connection`], a pair of text-frame channels.  The
//! client never sees sockets; closing the inbound channel means the server
//! went away, and dropping the outbound sender asks the transport to close.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod websocket;

pub use websocket::WebSocketConnector;

/// Errors raised while opening a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectorError {
    #[error("failed to connect to {address}: {reason}")]
    Connect { address: String, reason: String },
}

/// An open connection: frames to send and frames received.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to a server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Connection, ConnectorError>;
}
