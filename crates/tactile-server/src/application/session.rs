//! Per-client protocol session: handshake, keep-alive and request routing.
//!
//! # Session phases (for beginners)
//!
//! ```text
//! AwaitingHandshake ──RequestServerInfo──► Active ──no Ping within MaxPingTime──► PingTimedOut
//!                                            │
//!                                            └──transport closed──► Closed
//! ```
//!
//! Every inbound request passes the same checks, in this order, before it is
//! acted on:
//!
//! 1. id 0 is reserved for server messages → `ERROR_MSG`
//! 2. server-only message types (`Ok`, `DeviceList`, ...) → `ERROR_MSG`
//! 3. session timed out, or its ping deadline has passed → `ERROR_PING`
//! 4. session closed → `ERROR_UNKNOWN`
//! 5. handshake missing, or repeated → `ERROR_INIT`
//!
//! Every request gets exactly one reply: either the result or an `Error`
//! carrying the request's id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tactile_core::protocol::messages::{RequestServerInfoMessage, ServerInfoMessage};
use tactile_core::{
    DeviceError, ErrorCode, HandshakeError, Message, MessageError, MessageVersion, ProtocolError,
    SERVER_MESSAGE_ID,
};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::device_manager::DeviceManager;
use super::discovery::{DeviceEvent, DiscoveryBackend};
use super::log::ClientLogger;

/// Notification from the session to whoever drives the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// A server-originated message (id 0) to forward to the client.
    Message(Message),
    /// The handshake completed.
    ClientConnected { client_name: String },
    /// The transport closed and the session was torn down.
    ClientDisconnected,
    /// The client missed its ping deadline; the session is over.
    PingTimeout,
}

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingHandshake,
    Active,
    PingTimedOut,
    Closed,
}

/// Settings announced in the handshake reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    pub server_name: String,
    /// Maximum interval between client pings; 0 disables the check.
    pub max_ping_time_ms: u32,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_name: "Tactile Server".to_string(),
            max_ping_time_ms: 0,
        }
    }
}

struct SessionState {
    phase: SessionPhase,
    client_name: Option<String>,
    last_ping: Instant,
}

impl SessionState {
    /// Moves an overdue `Active` session to `PingTimedOut`.  Returns `true` if
    /// this call made the transition.
    fn expire_if_overdue(&mut self, max_ping_time: Duration) -> bool {
        if self.phase != SessionPhase::Active || self.last_ping.elapsed() < max_ping_time {
            return false;
        }
        self.phase = SessionPhase::PingTimedOut;
        true
    }
}

struct Inner {
    options: ServerOptions,
    state: Mutex<SessionState>,
    /// Negotiated schema version, shared with the device manager.
    version: Arc<AtomicU32>,
    devices: Arc<DeviceManager>,
    logger: ClientLogger,
    events: mpsc::UnboundedSender<ServerEvent>,
    /// Internal shutdown signal; composed into every device dispatch.
    shutdown: CancellationToken,
    ping_reset: Notify,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

/// The server side of one client connection.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct ProtocolServer {
    inner: Arc<Inner>,
}

impl ProtocolServer {
    /// Creates a session and the receiver for its [`ServerEvent`]s.
    ///
    /// Must be called inside a Tokio runtime: the device event pump is
    /// spawned here.
    pub fn new(options: ServerOptions) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let logger = ClientLogger::new(events.clone());
        let version = Arc::new(AtomicU32::new(MessageVersion::CURRENT.as_u32()));
        let (devices, device_rx) =
            DeviceManager::new(Arc::clone(&version), events.clone(), logger.clone());
        let devices = Arc::new(devices);
        let shutdown = CancellationToken::new();
        devices.spawn_event_pump(device_rx, shutdown.clone());

        let inner = Arc::new(Inner {
            options,
            state: Mutex::new(SessionState {
                phase: SessionPhase::AwaitingHandshake,
                client_name: None,
                last_ping: Instant::now(),
            }),
            version,
            devices,
            logger,
            events,
            shutdown,
            ping_reset: Notify::new(),
            ping_task: Mutex::new(None),
        });
        (Self { inner }, events_rx)
    }

    // ── Wiring ────────────────────────────────────────────────────────────────

    /// Sender a discovery back-end pushes its [`DeviceEvent`]s onto.
    pub fn device_event_sender(&self) -> mpsc::UnboundedSender<DeviceEvent> {
        self.inner.devices.device_event_sender()
    }

    pub fn add_backend(&self, backend: Arc<dyn DiscoveryBackend>) {
        self.inner.devices.add_backend(backend);
    }

    pub fn device_manager(&self) -> &Arc<DeviceManager> {
        &self.inner.devices
    }

    pub fn logger(&self) -> &ClientLogger {
        &self.inner.logger
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock_state().phase
    }

    pub fn client_name(&self) -> Option<String> {
        self.inner.lock_state().client_name.clone()
    }

    /// Version to decode inbound and encode outbound frames with.
    pub fn negotiated_version(&self) -> MessageVersion {
        MessageVersion::try_from(self.inner.version.load(Ordering::SeqCst))
            .unwrap_or(MessageVersion::CURRENT)
    }

    // ── Request processing ────────────────────────────────────────────────────

    /// Processes one decoded request and returns its reply.
    ///
    /// Never fails: every error becomes an `Error` message carrying the
    /// request's id.  `cancel` is composed with the session's own shutdown
    /// signal for any device work the request starts.
    pub async fn process(&self, msg: Message, cancel: &CancellationToken) -> Message {
        let id = msg.id();
        let name = msg.name();
        match self.try_process(msg, cancel).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("{name} (id {id}) rejected: {e}");
                e.to_error_message(id)
            }
        }
    }

    async fn try_process(
        &self,
        msg: Message,
        cancel: &CancellationToken,
    ) -> Result<Message, ProtocolError> {
        let name = msg.name();
        if msg.id() == SERVER_MESSAGE_ID {
            return Err(MessageError::ZeroId { name }.into());
        }
        if msg.is_server_only() {
            return Err(MessageError::OutgoingOnly { name }.into());
        }

        // Phase checks and the cheap in-session replies happen under one lock
        // so nothing slips past a concurrent ping timeout.
        let msg = {
            let mut state = self.inner.lock_state();
            // The deadline holds even if the timer task has not run yet.
            if let Some(max_ping_time) = self.inner.max_ping_time() {
                if state.expire_if_overdue(max_ping_time) {
                    drop(state);
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(async move { inner.on_ping_timeout().await });
                    return Err(ProtocolError::PingTimeout {
                        max_ping_time_ms: self.inner.options.max_ping_time_ms,
                    });
                }
            }
            match state.phase {
                SessionPhase::PingTimedOut => {
                    return Err(ProtocolError::PingTimeout {
                        max_ping_time_ms: self.inner.options.max_ping_time_ms,
                    })
                }
                SessionPhase::Closed => {
                    return Err(ProtocolError::Unknown("session is closed".to_string()))
                }
                SessionPhase::AwaitingHandshake => match msg {
                    Message::RequestServerInfo(request) => {
                        drop(state);
                        return self.handshake(request);
                    }
                    _ => return Err(HandshakeError::NotPerformed { name }.into()),
                },
                SessionPhase::Active => match msg {
                    Message::RequestServerInfo(_) => {
                        return Err(HandshakeError::AlreadyCompleted.into())
                    }
                    Message::Ping(ping) => {
                        drop(state);
                        self.inner.record_ping();
                        return Ok(Message::ok(ping.id));
                    }
                    Message::Test(test) => return Ok(Message::Test(test)),
                    Message::RequestLog(request) => {
                        self.inner.logger.set_level(request.log_level);
                        return Ok(Message::ok(request.id));
                    }
                    other => other,
                },
            }
        };

        let token = self.inner.shutdown.child_token();
        let _guard = token.clone().drop_guard();
        let forward = token.clone();
        let caller = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => forward.cancel(),
                _ = forward.cancelled() => {}
            }
        });

        self.inner.devices.dispatch(msg, &token).await
    }

    fn handshake(&self, request: RequestServerInfoMessage) -> Result<Message, ProtocolError> {
        let supported = MessageVersion::CURRENT.as_u32();
        let requested = request.message_version.unwrap_or(supported);
        let version = MessageVersion::try_from(requested)
            .map_err(|_| HandshakeError::UnsupportedVersion {
                requested,
                supported,
            })?;

        {
            let mut state = self.inner.lock_state();
            if state.phase != SessionPhase::AwaitingHandshake {
                return Err(HandshakeError::AlreadyCompleted.into());
            }
            state.phase = SessionPhase::Active;
            state.client_name = Some(request.client_name.clone());
            state.last_ping = Instant::now();
        }
        self.inner.version.store(version.as_u32(), Ordering::SeqCst);

        let max_ping_time_ms = self.inner.options.max_ping_time_ms;
        if let Some(max_ping_time) = self.inner.max_ping_time() {
            self.start_ping_timer(max_ping_time);
        }

        info!(
            "client {:?} connected (message version {version})",
            request.client_name
        );
        let _ = self.inner.events.send(ServerEvent::ClientConnected {
            client_name: request.client_name,
        });

        Ok(Message::ServerInfo(ServerInfoMessage {
            id: request.id,
            server_name: self.inner.options.server_name.clone(),
            message_version: supported,
            max_ping_time: max_ping_time_ms,
        }))
    }

    // ── Keep-alive ────────────────────────────────────────────────────────────

    fn start_ping_timer(&self, max_ping_time: Duration) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let deadline = {
                    let state = inner.lock_state();
                    if state.phase != SessionPhase::Active {
                        return;
                    }
                    state.last_ping + max_ping_time
                };
                tokio::select! {
                    _ = inner.shutdown.cancelled() => return,
                    _ = inner.ping_reset.notified() => continue,
                    _ = tokio::time::sleep_until(deadline) => {
                        if inner.lock_state().expire_if_overdue(max_ping_time) {
                            inner.on_ping_timeout().await;
                            return;
                        }
                    }
                }
            }
        });

        let previous = self
            .inner
            .ping_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Tears the session down after the transport closed.
    ///
    /// Stops every device and every scan (best-effort), cancels in-flight
    /// device work, and emits [`ServerEvent::ClientDisconnected`].
    pub async fn disconnect(&self) {
        let previous = {
            let mut state = self.inner.lock_state();
            let previous = state.phase;
            state.phase = SessionPhase::Closed;
            previous
        };
        if previous == SessionPhase::Closed {
            return;
        }

        self.inner.shutdown.cancel();
        if let Some(task) = self
            .inner
            .ping_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            task.abort();
        }

        let devices = &self.inner.devices;
        if previous == SessionPhase::Active {
            if let Err(e) = devices.stop_all_devices(&CancellationToken::new()).await {
                warn!("stop-all on disconnect: {e}");
            }
        }
        if devices.scan().is_scanning() {
            if let Err(e) = devices.scan().stop().await {
                warn!("stop scanning on disconnect: {e}");
            }
        }
        devices.disconnect_all().await;

        info!("client disconnected");
        let _ = self.inner.events.send(ServerEvent::ClientDisconnected);
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_ping(&self) {
        self.lock_state().last_ping = Instant::now();
        self.ping_reset.notify_one();
    }

    /// `None` when the keep-alive check is disabled.
    fn max_ping_time(&self) -> Option<Duration> {
        match self.options.max_ping_time_ms {
            0 => None,
            ms => Some(Duration::from_millis(u64::from(ms))),
        }
    }

    async fn on_ping_timeout(&self) {
        let max_ping_time_ms = self.options.max_ping_time_ms;
        warn!("no ping within {max_ping_time_ms} ms; ending session");

        self.shutdown.cancel();
        match self.devices.stop_all_devices(&CancellationToken::new()).await {
            Ok(()) => {}
            Err(DeviceError::StopAllFailed(failures)) => {
                for failure in failures {
                    warn!("stop-all after ping timeout: {failure}");
                }
            }
            Err(e) => warn!("stop-all after ping timeout: {e}"),
        }

        let error = Message::error(
            SERVER_MESSAGE_ID,
            ErrorCode::Ping,
            ProtocolError::PingTimeout { max_ping_time_ms }.to_string(),
        );
        let _ = self.events.send(ServerEvent::Message(error));
        let _ = self.events.send(ServerEvent::PingTimeout);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tactile_core::protocol::messages::{
        BareMessage, DeviceIndexMessage, LogLevel, RequestLogMessage, TestMessage,
    };

    fn make_server(max_ping_time_ms: u32) -> (ProtocolServer, mpsc::UnboundedReceiver<ServerEvent>) {
        ProtocolServer::new(ServerOptions {
            server_name: "Test Server".to_string(),
            max_ping_time_ms,
        })
    }

    fn handshake_request(id: u32, version: Option<u32>) -> Message {
        Message::RequestServerInfo(RequestServerInfoMessage {
            id,
            client_name: "unit".to_string(),
            message_version: version,
        })
    }

    fn ping(id: u32) -> Message {
        Message::Ping(BareMessage::new(id))
    }

    fn code_of(reply: &Message) -> Option<ErrorCode> {
        match reply {
            Message::Error(e) => Some(e.error_code),
            _ => None,
        }
    }

    async fn connect(server: &ProtocolServer) {
        let reply = server
            .process(handshake_request(1, None), &CancellationToken::new())
            .await;
        assert!(matches!(reply, Message::ServerInfo(_)), "{reply:?}");
    }

    // ── Id and origin checks ──────────────────────────────────────────────────

    #[tokio::test]
    async fn test_id_zero_is_rejected_before_anything_else() {
        // Arrange
        let (server, _rx) = make_server(0);

        // Act
        let reply = server.process(ping(0), &CancellationToken::new()).await;

        // Assert: ERROR_MSG even though the handshake has not happened.
        assert_eq!(code_of(&reply), Some(ErrorCode::Message));
        assert_eq!(reply.id(), 0);
    }

    #[tokio::test]
    async fn test_server_only_message_is_rejected() {
        let (server, _rx) = make_server(0);
        connect(&server).await;

        let reply = server
            .process(Message::ok(4), &CancellationToken::new())
            .await;

        assert_eq!(code_of(&reply), Some(ErrorCode::Message));
        assert_eq!(reply.id(), 4);
    }

    // ── Handshake ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_request_before_handshake_is_init_error() {
        let (server, _rx) = make_server(0);

        let reply = server.process(ping(3), &CancellationToken::new()).await;

        assert_eq!(code_of(&reply), Some(ErrorCode::Init));
        assert_eq!(reply.id(), 3);
        assert_eq!(server.phase(), SessionPhase::AwaitingHandshake);
    }

    #[tokio::test]
    async fn test_handshake_reply_and_connected_event() {
        // Arrange
        let (server, mut rx) = make_server(500);

        // Act
        let reply = server
            .process(handshake_request(7, Some(1)), &CancellationToken::new())
            .await;

        // Assert
        assert_eq!(
            reply,
            Message::ServerInfo(ServerInfoMessage {
                id: 7,
                server_name: "Test Server".to_string(),
                message_version: MessageVersion::CURRENT.as_u32(),
                max_ping_time: 500,
            })
        );
        assert_eq!(server.phase(), SessionPhase::Active);
        assert_eq!(server.negotiated_version(), MessageVersion::V1);
        assert_eq!(server.client_name().as_deref(), Some("unit"));
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::ClientConnected {
                client_name: "unit".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_second_handshake_is_init_error() {
        let (server, _rx) = make_server(0);
        connect(&server).await;

        let reply = server
            .process(handshake_request(2, None), &CancellationToken::new())
            .await;

        assert_eq!(code_of(&reply), Some(ErrorCode::Init));
    }

    #[tokio::test]
    async fn test_newer_version_than_server_is_init_error() {
        let (server, _rx) = make_server(0);

        let reply = server
            .process(handshake_request(1, Some(99)), &CancellationToken::new())
            .await;

        assert_eq!(code_of(&reply), Some(ErrorCode::Init));
        assert_eq!(server.phase(), SessionPhase::AwaitingHandshake);
    }

    // ── Session-level requests ────────────────────────────────────────────────

    #[tokio::test]
    async fn test_ping_test_and_request_log() {
        let (server, _rx) = make_server(0);
        connect(&server).await;
        let cancel = CancellationToken::new();

        assert_eq!(server.process(ping(2), &cancel).await, Message::ok(2));

        let echo = Message::Test(TestMessage {
            id: 3,
            test_string: "hello".to_string(),
        });
        assert_eq!(server.process(echo.clone(), &cancel).await, echo);

        let log = Message::RequestLog(RequestLogMessage {
            id: 4,
            log_level: LogLevel::Debug,
        });
        assert_eq!(server.process(log, &cancel).await, Message::ok(4));
        assert_eq!(server.logger().level(), LogLevel::Debug);
    }

    #[tokio::test]
    async fn test_unknown_device_is_device_error_with_request_id() {
        let (server, _rx) = make_server(0);
        connect(&server).await;

        let reply = server
            .process(
                Message::StopDeviceCmd(DeviceIndexMessage {
                    id: 11,
                    device_index: 5,
                }),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(code_of(&reply), Some(ErrorCode::Device));
        assert_eq!(reply.id(), 11);
    }

    #[tokio::test]
    async fn test_start_scanning_without_backends_is_device_error() {
        let (server, _rx) = make_server(0);
        connect(&server).await;

        let reply = server
            .process(
                Message::StartScanning(BareMessage::new(2)),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(code_of(&reply), Some(ErrorCode::Device));
    }

    // ── Ping timeout ──────────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_pings_at_half_interval_never_time_out() {
        // Arrange
        let (server, _rx) = make_server(100);
        connect(&server).await;
        let cancel = CancellationToken::new();

        // Act
        for id in 2..40 {
            tokio::time::sleep(Duration::from_millis(49)).await;
            let reply = server.process(ping(id), &cancel).await;

            // Assert
            assert_eq!(reply, Message::ok(id));
        }
        assert_eq!(server.phase(), SessionPhase::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missed_ping_ends_session() {
        // Arrange
        let (server, mut rx) = make_server(100);
        connect(&server).await;
        let _ = rx.recv().await; // ClientConnected

        // Act
        tokio::time::sleep(Duration::from_millis(150)).await;
        let reply = server.process(ping(2), &CancellationToken::new()).await;

        // Assert
        assert_eq!(code_of(&reply), Some(ErrorCode::Ping));
        assert_eq!(reply.id(), 2);
        assert_eq!(server.phase(), SessionPhase::PingTimedOut);
        match rx.recv().await {
            Some(ServerEvent::Message(Message::Error(e))) => {
                assert_eq!(e.id, 0);
                assert_eq!(e.error_code, ErrorCode::Ping);
            }
            other => panic!("expected ERROR_PING, got {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(ServerEvent::PingTimeout));
    }

    #[tokio::test]
    async fn test_overdue_ping_is_rejected_before_timer_task_runs() {
        // Arrange
        let (server, mut rx) = make_server(50);
        connect(&server).await;
        let _ = rx.recv().await; // ClientConnected

        // Act: block the only runtime thread so the timer task cannot run.
        std::thread::sleep(Duration::from_millis(150));
        let reply = server.process(ping(2), &CancellationToken::new()).await;

        // Assert
        assert_eq!(code_of(&reply), Some(ErrorCode::Ping));
        assert_eq!(reply.id(), 2);
        assert_eq!(server.phase(), SessionPhase::PingTimedOut);
        match rx.recv().await {
            Some(ServerEvent::Message(Message::Error(e))) => {
                assert_eq!(e.error_code, ErrorCode::Ping);
            }
            other => panic!("expected ERROR_PING, got {other:?}"),
        }
        assert_eq!(rx.recv().await, Some(ServerEvent::PingTimeout));
        let again = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(again.is_err(), "timeout must be reported once: {again:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_ping_time_disables_timer() {
        let (server, _rx) = make_server(0);
        connect(&server).await;

        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(server.phase(), SessionPhase::Active);
    }

    // ── Disconnect ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_disconnect_closes_session() {
        let (server, mut rx) = make_server(0);
        connect(&server).await;
        let _ = rx.recv().await; // ClientConnected

        server.disconnect().await;
        let reply = server.process(ping(5), &CancellationToken::new()).await;

        assert_eq!(server.phase(), SessionPhase::Closed);
        assert_eq!(code_of(&reply), Some(ErrorCode::Unknown));
        assert_eq!(rx.recv().await, Some(ServerEvent::ClientDisconnected));
    }
}
