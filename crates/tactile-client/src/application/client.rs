//! The connected protocol client.
//!
//! [`ProtocolClient::connect`] opens a [`Connector`], starts a reader task
//! that feeds every inbound message through the [`RequestTracker`], performs
//! the handshake, and (when the server asks for it) starts a keep-alive task
//! that pings at half the server's `MaxPingTime`.
//!
//! Server-initiated messages (id 0) surface as [`ClientEvent`]s on the
//! receiver returned by `connect`.

use std::sync::Arc;
use std::time::Duration;

use tactile_core::protocol::messages::{
    BareMessage, DeviceInfo, DeviceInfoV0, DeviceInfoV1, LogLevel, RequestLogMessage,
    RequestServerInfoMessage, ServerInfoMessage,
};
use tactile_core::{decode_messages, ErrorCode, Message, MessageVersion, SERVER_MESSAGE_ID};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::request_tracker::{RequestError, RequestTracker};
use crate::infrastructure::connector::{Connection, Connector, ConnectorError};

/// Errors surfaced by [`ProtocolClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connect(#[from] ConnectorError),

    #[error(transparent)]
    Request(#[from] RequestError),

    /// The server answered with a message type the request does not expect.
    #[error("unexpected {received} reply to {request}")]
    UnexpectedReply {
        request: &'static str,
        received: &'static str,
    },

    /// The transport is gone; nothing can be sent.
    #[error("connection closed")]
    Disconnected,
}

impl ClientError {
    /// Error class when the server rejected the request.
    pub fn server_code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Request(RequestError::Server { code, .. }) => Some(*code),
            _ => None,
        }
    }
}

/// Unsolicited notification from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    DeviceAdded(DeviceInfo),
    DeviceRemoved { device_index: u32 },
    ScanningFinished,
    Log { level: LogLevel, message: String },
    /// A server-side error not tied to a request (e.g. `ERROR_PING`).
    Error { code: ErrorCode, message: String },
    /// The connection closed; no further events follow.
    Disconnected,
}

/// Handshake settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub client_name: String,
    /// Schema version requested in the handshake and used on the wire.
    pub message_version: MessageVersion,
}

impl ClientOptions {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            message_version: MessageVersion::CURRENT,
        }
    }

    pub fn with_version(mut self, version: MessageVersion) -> Self {
        self.message_version = version;
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::new("Tactile Client")
    }
}

/// A client connected to one server.
///
/// Dropping the client stops its background tasks.
pub struct ProtocolClient {
    tracker: Arc<RequestTracker>,
    outbound: mpsc::UnboundedSender<String>,
    server_info: ServerInfoMessage,
    shutdown: CancellationToken,
}

impl ProtocolClient {
    /// Connects, performs the handshake, and starts keep-alive if required.
    ///
    /// # Errors
    ///
    /// [`ClientError::Connect`] if the transport cannot be opened, or the
    /// server's rejection of the handshake.
    pub async fn connect(
        connector: &dyn Connector,
        options: ClientOptions,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClientEvent>), ClientError> {
        let Connection { outbound, inbound } = connector.connect().await?;
        let version = options.message_version;
        let tracker = Arc::new(RequestTracker::new(version));
        let shutdown = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(
            inbound,
            Arc::clone(&tracker),
            events_tx,
            version,
            shutdown.clone(),
        ));

        let handshake = Message::RequestServerInfo(RequestServerInfoMessage {
            id: 0,
            client_name: options.client_name.clone(),
            message_version: Some(version.as_u32()),
        });
        let server_info = match send_request(&tracker, &outbound, handshake).await {
            Ok(Message::ServerInfo(info)) => info,
            other => {
                shutdown.cancel();
                tracker.close();
                return Err(match other {
                    Ok(reply) => ClientError::UnexpectedReply {
                        request: "RequestServerInfo",
                        received: reply.name(),
                    },
                    Err(e) => e,
                });
            }
        };
        info!(
            "connected to {:?} (server version {}, max ping time {} ms)",
            server_info.server_name, server_info.message_version, server_info.max_ping_time
        );

        let client = Self {
            tracker,
            outbound,
            server_info,
            shutdown,
        };
        if client.server_info.max_ping_time > 0 {
            let half = u64::from(client.server_info.max_ping_time / 2).max(1);
            client.spawn_keep_alive(Duration::from_millis(half));
        }
        Ok((client, events_rx))
    }

    pub fn server_info(&self) -> &ServerInfoMessage {
        &self.server_info
    }

    /// `false` once the connection closed or [`disconnect`](Self::disconnect)
    /// was called.
    pub fn is_connected(&self) -> bool {
        !self.tracker.is_closed()
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// Sends `msg` with a fresh id and waits for its reply.
    ///
    /// # Errors
    ///
    /// The server's `Error` reply as [`RequestError::Server`], or a closed
    /// connection.
    pub async fn request(&self, msg: Message) -> Result<Message, ClientError> {
        send_request(&self.tracker, &self.outbound, msg).await
    }

    pub async fn start_scanning(&self) -> Result<(), ClientError> {
        self.expect_ok(Message::StartScanning(BareMessage::new(0)))
            .await
    }

    pub async fn stop_scanning(&self) -> Result<(), ClientError> {
        self.expect_ok(Message::StopScanning(BareMessage::new(0)))
            .await
    }

    pub async fn stop_all_devices(&self) -> Result<(), ClientError> {
        self.expect_ok(Message::StopAllDevices(BareMessage::new(0)))
            .await
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        self.expect_ok(Message::Ping(BareMessage::new(0))).await
    }

    /// Asks the server to forward its log lines at `level` or above.
    pub async fn request_log(&self, level: LogLevel) -> Result<(), ClientError> {
        self.expect_ok(Message::RequestLog(RequestLogMessage {
            id: 0,
            log_level: level,
        }))
        .await
    }

    /// Currently connected devices, in the newest shape.
    pub async fn request_device_list(&self) -> Result<Vec<DeviceInfo>, ClientError> {
        match self
            .request(Message::RequestDeviceList(BareMessage::new(0)))
            .await?
        {
            Message::DeviceList(list) => Ok(list.devices),
            Message::DeviceListV1(list) => Ok(list.devices.into_iter().map(Into::into).collect()),
            Message::DeviceListV0(list) => Ok(list.devices.into_iter().map(Into::into).collect()),
            other => Err(ClientError::UnexpectedReply {
                request: "RequestDeviceList",
                received: other.name(),
            }),
        }
    }

    /// Sends a device command and returns the server's reply (`Ok`, or a
    /// reading such as `BatteryLevelReading`).
    pub async fn send_device_command(&self, command: Message) -> Result<Message, ClientError> {
        self.request(command).await
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Stops the background tasks and fails every pending request.
    pub fn disconnect(self) {
        debug!("disconnecting");
        // Drop does the work.
    }

    async fn expect_ok(&self, msg: Message) -> Result<(), ClientError> {
        let request = msg.name();
        match self.request(msg).await? {
            Message::Ok(_) => Ok(()),
            other => Err(ClientError::UnexpectedReply {
                request,
                received: other.name(),
            }),
        }
    }

    fn spawn_keep_alive(&self, period: Duration) {
        let tracker = Arc::clone(&self.tracker);
        let outbound = self.outbound.clone();
        let shutdown = self.shutdown.clone();
        debug!("pinging every {} ms", period.as_millis());

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let (text, pending) = match tracker.prepare(Message::Ping(BareMessage::new(0))) {
                    Ok(prepared) => prepared,
                    Err(_) => break,
                };
                if outbound.send(text).is_err() {
                    break;
                }
                // The reply is awaited off the tick loop so a slow reply never
                // delays the next ping.
                tokio::spawn(async move {
                    if let Err(e) = pending.await {
                        warn!("keep-alive ping failed: {e}");
                    }
                });
            }
            debug!("keep-alive stopped");
        });
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.tracker.close();
    }
}

async fn send_request(
    tracker: &RequestTracker,
    outbound: &mpsc::UnboundedSender<String>,
    msg: Message,
) -> Result<Message, ClientError> {
    let (text, pending) = tracker.prepare(msg)?;
    outbound.send(text).map_err(|_| ClientError::Disconnected)?;
    Ok(pending.await?)
}

async fn read_loop(
    mut inbound: mpsc::UnboundedReceiver<String>,
    tracker: Arc<RequestTracker>,
    events: mpsc::UnboundedSender<ClientEvent>,
    version: MessageVersion,
    shutdown: CancellationToken,
) {
    loop {
        let text = tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = inbound.recv() => match frame {
                Some(text) => text,
                None => {
                    info!("server closed the connection");
                    break;
                }
            },
        };

        for decoded in decode_messages(&text, version) {
            match decoded {
                Ok(msg) => {
                    if let Some(event) = tracker.on_reply_received(msg).and_then(to_event) {
                        let _ = events.send(event);
                    }
                }
                Err(e) => {
                    warn!("undecodable message from server: {e}");
                    let failure = RequestError::InvalidReply {
                        id: e.id,
                        reason: e.to_string(),
                    };
                    if e.id != SERVER_MESSAGE_ID && tracker.fail(e.id, failure) {
                        continue;
                    }
                    let _ = events.send(ClientEvent::Error {
                        code: ErrorCode::Message,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    tracker.close();
    let _ = events.send(ClientEvent::Disconnected);
}

fn to_event(msg: Message) -> Option<ClientEvent> {
    let event = match msg {
        Message::DeviceAdded(m) => ClientEvent::DeviceAdded(DeviceInfo {
            device_index: m.device_index,
            device_name: m.device_name,
            device_messages: m.device_messages,
        }),
        Message::DeviceAddedV1(m) => ClientEvent::DeviceAdded(
            DeviceInfoV1 {
                device_index: m.device_index,
                device_name: m.device_name,
                device_messages: m.device_messages,
            }
            .into(),
        ),
        Message::DeviceAddedV0(m) => ClientEvent::DeviceAdded(
            DeviceInfoV0 {
                device_index: m.device_index,
                device_name: m.device_name,
                device_messages: m.device_messages,
            }
            .into(),
        ),
        Message::DeviceRemoved(m) => ClientEvent::DeviceRemoved {
            device_index: m.device_index,
        },
        Message::ScanningFinished(_) => ClientEvent::ScanningFinished,
        Message::Log(m) => ClientEvent::Log {
            level: m.log_level,
            message: m.log_message,
        },
        Message::Error(e) => ClientEvent::Error {
            code: e.error_code,
            message: e.error_message,
        },
        other => {
            debug!("ignoring unsolicited {}", other.name());
            return None;
        }
    };
    Some(event)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::infrastructure::connector::MockConnector;
    use tactile_core::encode_message;
    use tactile_core::protocol::messages::{DeviceAddedMessage, DeviceMessages};

    /// The server end of an in-memory connection.
    struct FakeServer {
        frames: mpsc::UnboundedReceiver<String>,
        push: mpsc::UnboundedSender<String>,
    }

    impl FakeServer {
        fn reply(&self, msg: Message) {
            let _ = self.push.send(encode_message(&msg, MessageVersion::CURRENT));
        }

        async fn next_request(&mut self) -> Message {
            let frame = self.frames.recv().await.expect("client frame");
            decode_messages(&frame, MessageVersion::CURRENT)
                .into_iter()
                .next()
                .expect("one message")
                .expect("valid message")
        }
    }

    fn fake_connector() -> (MockConnector, FakeServer) {
        let (outbound, frames) = mpsc::unbounded_channel();
        let (push, inbound) = mpsc::unbounded_channel();
        let connection = Mutex::new(Some(Connection { outbound, inbound }));
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(move || {
            connection
                .lock()
                .unwrap()
                .take()
                .ok_or(ConnectorError::Connect {
                    address: "fake".to_string(),
                    reason: "already used".to_string(),
                })
        });
        (connector, FakeServer { frames, push })
    }

    fn server_info(id: u32, max_ping_time: u32) -> Message {
        Message::ServerInfo(ServerInfoMessage {
            id,
            server_name: "Fake".to_string(),
            message_version: 2,
            max_ping_time,
        })
    }

    async fn connected(
        max_ping_time: u32,
    ) -> (ProtocolClient, mpsc::UnboundedReceiver<ClientEvent>, FakeServer) {
        let (connector, mut server) = fake_connector();
        let answer = tokio::spawn(async move {
            let request = server.next_request().await;
            server.reply(server_info(request.id(), max_ping_time));
            server
        });
        let (client, events) = ProtocolClient::connect(&connector, ClientOptions::new("unit"))
            .await
            .expect("connect");
        (client, events, answer.await.unwrap())
    }

    #[tokio::test]
    async fn test_handshake_sends_current_version_and_stores_server_info() {
        // Arrange
        let (connector, mut server) = fake_connector();
        let answer = tokio::spawn(async move {
            let request = server.next_request().await;
            server.reply(server_info(request.id(), 0));
            request
        });

        // Act
        let (client, _events) = ProtocolClient::connect(&connector, ClientOptions::new("unit"))
            .await
            .expect("connect");

        // Assert
        let request = answer.await.unwrap();
        assert_eq!(
            request,
            Message::RequestServerInfo(RequestServerInfoMessage {
                id: 1,
                client_name: "unit".to_string(),
                message_version: Some(MessageVersion::CURRENT.as_u32()),
            })
        );
        assert_eq!(client.server_info().server_name, "Fake");
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_rejected_handshake_is_reported() {
        let (connector, mut server) = fake_connector();
        tokio::spawn(async move {
            let request = server.next_request().await;
            server.reply(Message::error(request.id(), ErrorCode::Init, "too new"));
            // Keep the connection open until the client gives up.
            let _ = server.frames.recv().await;
        });

        let result = ProtocolClient::connect(&connector, ClientOptions::new("unit")).await;

        let err = result.err().expect("handshake must fail");
        assert_eq!(err.server_code(), Some(ErrorCode::Init));
    }

    #[tokio::test]
    async fn test_connector_failure_is_connect_error() {
        let mut connector = MockConnector::new();
        connector.expect_connect().returning(|| {
            Err(ConnectorError::Connect {
                address: "nowhere".to_string(),
                reason: "refused".to_string(),
            })
        });

        let result = ProtocolClient::connect(&connector, ClientOptions::default()).await;

        assert!(matches!(result, Err(ClientError::Connect(_))));
    }

    #[tokio::test]
    async fn test_unsolicited_device_added_becomes_event() {
        // Arrange
        let (_client, mut events, server) = connected(0).await;

        // Act
        server.reply(Message::DeviceAdded(DeviceAddedMessage {
            id: 0,
            device_index: 3,
            device_name: "Wand".to_string(),
            device_messages: DeviceMessages::new(),
        }));

        // Assert
        assert_eq!(
            events.recv().await,
            Some(ClientEvent::DeviceAdded(DeviceInfo {
                device_index: 3,
                device_name: "Wand".to_string(),
                device_messages: DeviceMessages::new(),
            }))
        );
    }

    #[tokio::test]
    async fn test_typed_request_resolves_on_ok() {
        let (client, _events, mut server) = connected(0).await;
        let responder = tokio::spawn(async move {
            let request = server.next_request().await;
            assert!(matches!(request, Message::StartScanning(_)));
            server.reply(Message::ok(request.id()));
            server
        });

        let result = client.start_scanning().await;

        assert_eq!(result, Ok(()));
        let _server = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_reply_fails_its_request() {
        // Arrange: the reply carries the right id but an unknown field.
        let (client, mut events, mut server) = connected(0).await;
        let responder = tokio::spawn(async move {
            let request = server.next_request().await;
            let _ = server
                .push
                .send(format!(r#"[{{"Ok":{{"Id":{},"Bogus":1}}}}]"#, request.id()));
            server
        });

        // Act
        let result = tokio::time::timeout(Duration::from_secs(5), client.ping())
            .await
            .expect("ping must resolve");

        // Assert
        match result {
            Err(ClientError::Request(RequestError::InvalidReply { id, .. })) => assert_eq!(id, 2),
            other => panic!("expected InvalidReply, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "no stray error event");
        let _server = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_close_fails_pending_request_and_emits_disconnected() {
        // Arrange
        let (client, mut events, mut server) = connected(0).await;
        let closer = tokio::spawn(async move {
            let _ = server.next_request().await;
            drop(server);
        });

        // Act
        let result = client.ping().await;

        // Assert
        closer.await.unwrap();
        assert!(matches!(
            result,
            Err(ClientError::Request(RequestError::ConnectionClosed { .. }))
        ));
        assert_eq!(events.recv().await, Some(ClientEvent::Disconnected));
        assert!(!client.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_pings_at_half_max_ping_time() {
        // Arrange
        let (_client, _events, mut server) = connected(100).await;

        // Act
        tokio::time::sleep(Duration::from_millis(175)).await;

        // Assert: pings at 50, 100 and 150 ms.
        let mut pings = 0;
        while let Ok(frame) = server.frames.try_recv() {
            if frame.contains("\"Ping\"") {
                pings += 1;
            }
        }
        assert_eq!(pings, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_ping_time_sends_no_pings() {
        let (_client, _events, mut server) = connected(0).await;

        tokio::time::sleep(Duration::from_secs(10)).await;

        assert!(server.frames.try_recv().is_err());
    }
}
