//! WebSocket transport: accept loop and per-client session driver.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting one client at a time and upgrading it to WebSocket.
//! 3. Creating a fresh [`ProtocolServer`] session and its discovery back-ends
//!    for that client.
//! 4. Decoding every text frame with the session's negotiated version and
//!    processing each request on its own task, so a slow device command
//!    never holds up a `Ping`.  Replies may therefore leave out of order.
//! 5. Encoding every outbound message (replies and server events) with the
//!    negotiated version on a single writer task.
//! 6. Closing the connection after a ping timeout, a client close, or
//!    shutdown, and tearing the session down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tactile_core::{decode_messages, encode_message, Message};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::discovery::{DeviceEvent, DiscoveryBackend};
use crate::application::session::{ProtocolServer, ServerEvent, ServerOptions};
use crate::infrastructure::storage::config::ServerConfig;

/// Builds the discovery back-ends for a new session, given the sender they
/// must report on.
pub type BackendFactory =
    Arc<dyn Fn(mpsc::UnboundedSender<DeviceEvent>) -> Vec<Arc<dyn DiscoveryBackend>> + Send + Sync>;

/// How long the writer gets to flush queued messages after the session ends.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds `config.bind_address:config.port` and serves clients until
/// `shutdown` is cancelled.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot be bound.
pub async fn run_server(
    config: ServerConfig,
    backends: BackendFactory,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind WebSocket listener on {addr}"))?;

    info!("Tactile server listening on {addr}");

    let options = ServerOptions {
        server_name: config.server_name,
        max_ping_time_ms: config.max_ping_time_ms,
    };
    serve(listener, options, backends, shutdown).await
}

/// Serves clients from an already bound `listener`, one at a time.
///
/// # Errors
///
/// Currently never fails; accept errors are logged and skipped.
pub async fn serve(
    listener: TcpListener,
    options: ServerOptions,
    backends: BackendFactory,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown requested; stopping accept loop");
                break;
            }
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                info!("new client connection from {peer_addr}");
                match run_session(stream, peer_addr, options.clone(), &backends, &shutdown).await {
                    Ok(()) => info!("session {peer_addr} closed"),
                    Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
                }
            }
            Err(e) => error!("accept error: {e}"),
        }
    }
    Ok(())
}

// ── Per-session driver ────────────────────────────────────────────────────────

async fn run_session(
    raw_stream: TcpStream,
    peer_addr: SocketAddr,
    options: ServerOptions,
    backends: &BackendFactory,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(raw_stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    let (server, mut events) = ProtocolServer::new(options);
    for backend in backends(server.device_event_sender()) {
        server.add_backend(backend);
    }

    let (ws_tx, mut ws_rx) = ws_stream.split();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(write_outbound(ws_tx, out_rx, server.clone(), peer_addr));

    // Cancelled when the session ends; in-flight requests observe it.
    let requests = shutdown.child_token();

    loop {
        tokio::select! {
            _ = requests.cancelled() => {
                debug!("session {peer_addr}: shutdown");
                break;
            }
            event = events.recv() => match event {
                Some(ServerEvent::Message(message)) => {
                    let _ = out_tx.send(message);
                }
                Some(ServerEvent::ClientConnected { client_name }) => {
                    info!("session {peer_addr}: client {client_name:?} completed handshake");
                }
                Some(ServerEvent::PingTimeout) => {
                    warn!("session {peer_addr}: ping timeout, closing");
                    break;
                }
                Some(ServerEvent::ClientDisconnected) | None => break,
            },
            frame = ws_rx.next() => {
                let text = match frame {
                    Some(Ok(WsMessage::Text(text))) => text,
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("session {peer_addr}: client closed the connection");
                        break;
                    }
                    Some(Ok(WsMessage::Binary(_))) => {
                        warn!("session {peer_addr}: unexpected binary frame (ignored)");
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(WsError::ConnectionClosed | WsError::Protocol(_))) => break,
                    Some(Err(e)) => {
                        warn!("session {peer_addr}: WebSocket error: {e}");
                        break;
                    }
                };
                dispatch_frame(&text, &server, &out_tx, &requests);
            }
        }
    }

    requests.cancel();
    server.disconnect().await;
    // Events queued before the teardown still go out (e.g. the ERROR_PING).
    while let Ok(event) = events.try_recv() {
        if let ServerEvent::Message(message) = event {
            let _ = out_tx.send(message);
        }
    }
    drop(out_tx);

    if tokio::time::timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        debug!("session {peer_addr}: writer did not flush in time");
    }
    Ok(())
}

/// Decodes one text frame and spawns a task per decoded request.
fn dispatch_frame(
    text: &str,
    server: &ProtocolServer,
    out_tx: &mpsc::UnboundedSender<Message>,
    requests: &CancellationToken,
) {
    for decoded in decode_messages(text, server.negotiated_version()) {
        match decoded {
            Ok(request) => {
                let server = server.clone();
                let out_tx = out_tx.clone();
                let cancel = requests.clone();
                tokio::spawn(async move {
                    let reply = server.process(request, &cancel).await;
                    let _ = out_tx.send(reply);
                });
            }
            Err(e) => {
                debug!("rejected inbound frame: {e}");
                let _ = out_tx.send(e.to_error_message());
            }
        }
    }
}

/// Writes queued messages until every sender is dropped, then closes.
async fn write_outbound<S>(
    mut sink: S,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    server: ProtocolServer,
    peer_addr: SocketAddr,
) where
    S: futures_util::Sink<WsMessage, Error = WsError> + Unpin,
{
    while let Some(message) = out_rx.recv().await {
        let text = encode_message(&message, server.negotiated_version());
        if sink.send(WsMessage::Text(text)).await.is_err() {
            debug!("session {peer_addr}: send failed (client gone)");
            return;
        }
    }
    let _ = sink.close().await;
}
