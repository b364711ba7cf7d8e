//! [`Connector`] over WebSocket text frames.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::{Connection, Connector, ConnectorError};

/// Connects to a server at a `ws://` URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, ConnectorError> {
        let (stream, _response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| ConnectorError::Connect {
                    address: self.url.clone(),
                    reason: e.to_string(),
                })?;
        info!("connected to {}", self.url);

        let (mut sink, mut source) = stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<String>();

        // Writer: runs until the client drops its sender.
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    debug!("WebSocket send failed: {e}");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: dropping `inbound_tx` tells the client the server is gone.
        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if inbound_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error from {url}: {e}");
                        break;
                    }
                }
            }
            debug!("connection to {url} closed");
        });

        Ok(Connection { outbound, inbound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        // Arrange: bind and drop a listener so the port is known to be free.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let connector = WebSocketConnector::new(format!("ws://{addr}"));

        // Act
        let result = connector.connect().await;

        // Assert
        assert!(matches!(result, Err(ConnectorError::Connect { .. })));
    }

    #[test]
    fn test_url_is_kept() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:12345");
        assert_eq!(connector.url(), "ws://127.0.0.1:12345");
    }
}
