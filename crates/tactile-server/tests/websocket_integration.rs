//! End-to-end tests over a real WebSocket connection on localhost.
//!
//! A listener is bound on an ephemeral port, the server loop is spawned with
//! a simulated back-end, and a `tokio-tungstenite` client speaks raw JSON
//! frames to it, so these tests cover the codec, the transport and the
//! session together.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tactile_server::application::discovery::{DeviceEvent, DiscoveryBackend};
use tactile_server::infrastructure::simulated::{SimulatedDevice, SimulatedDiscovery};
use tactile_server::infrastructure::transport::{serve, BackendFactory};
use tactile_server::ServerOptions;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn one_vibrator_backend() -> BackendFactory {
    Arc::new(|events: mpsc::UnboundedSender<DeviceEvent>| {
        let device = Arc::new(SimulatedDevice::new("Wand", "wand-1").with_vibrators(1));
        let backend: Arc<dyn DiscoveryBackend> =
            Arc::new(SimulatedDiscovery::new("sim", events).with_device(device));
        vec![backend]
    })
}

/// Starts a server and returns a connected client plus the shutdown token.
async fn start(max_ping_time_ms: u32) -> (Client, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let shutdown = CancellationToken::new();
    let options = ServerOptions {
        server_name: "WS Test".to_string(),
        max_ping_time_ms,
    };
    tokio::spawn(serve(listener, options, one_vibrator_backend(), shutdown.clone()));

    let (client, _) = connect_async(format!("ws://{addr}"))
        .await
        .expect("connect");
    (client, shutdown)
}

async fn send(client: &mut Client, frame: Value) {
    client
        .send(WsMessage::Text(frame.to_string()))
        .await
        .expect("send");
}

/// Receives frames until one holds a message satisfying `pred`.
async fn recv_until(client: &mut Client, pred: impl Fn(&str, &Value) -> bool) -> Value {
    let wait = async {
        loop {
            let frame = client.next().await.expect("stream ended").expect("ws error");
            let WsMessage::Text(text) = frame else {
                continue;
            };
            let batch: Value = serde_json::from_str(&text).expect("server sent valid JSON");
            for element in batch.as_array().expect("array frame") {
                let (name, body) = element
                    .as_object()
                    .and_then(|o| o.iter().next())
                    .expect("single-key element");
                if pred(name, body) {
                    return element.clone();
                }
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for frame")
}

async fn handshake(client: &mut Client, version: u32) -> Value {
    send(
        client,
        json!([{"RequestServerInfo": {"Id": 1, "ClientName": "ws", "MessageVersion": version}}]),
    )
    .await;
    recv_until(client, |name, _| name == "ServerInfo").await
}

#[tokio::test]
async fn test_handshake_over_websocket() {
    // Arrange
    let (mut client, shutdown) = start(0).await;

    // Act
    let reply = handshake(&mut client, 2).await;

    // Assert
    assert_eq!(
        reply,
        json!({"ServerInfo": {"Id": 1, "ServerName": "WS Test", "MessageVersion": 2, "MaxPingTime": 0}})
    );
    shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_frames_get_one_msg_error_each() {
    let (mut client, shutdown) = start(0).await;

    for bad in ["not json", "{}", "[]", r#"[{"NotAMessage":{}}]"#] {
        client
            .send(WsMessage::Text(bad.to_string()))
            .await
            .expect("send");
        let error = recv_until(&mut client, |name, _| name == "Error").await;
        assert_eq!(error["Error"]["ErrorCode"], json!(3), "input {bad:?}");
        assert_eq!(error["Error"]["Id"], json!(0), "input {bad:?}");
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_request_before_handshake_is_init_error() {
    let (mut client, shutdown) = start(0).await;

    send(&mut client, json!([{"StartScanning": {"Id": 5}}])).await;

    let error = recv_until(&mut client, |name, _| name == "Error").await;
    assert_eq!(error["Error"]["Id"], json!(5));
    assert_eq!(error["Error"]["ErrorCode"], json!(1));
    shutdown.cancel();
}

#[tokio::test]
async fn test_scan_and_command_with_v1_client() {
    // Arrange
    let (mut client, shutdown) = start(0).await;
    handshake(&mut client, 1).await;

    // Act
    send(&mut client, json!([{"StartScanning": {"Id": 2}}])).await;
    let added = recv_until(&mut client, |name, _| name == "DeviceAdded").await;

    // Assert: announced with index 1 in the version 1 shape.
    assert_eq!(added["DeviceAdded"]["Id"], json!(0));
    assert_eq!(added["DeviceAdded"]["DeviceIndex"], json!(1));
    assert_eq!(
        added["DeviceAdded"]["DeviceMessages"]["VibrateCmd"],
        json!({"FeatureCount": 1})
    );

    send(
        &mut client,
        json!([{"VibrateCmd": {"Id": 3, "DeviceIndex": 1, "Speeds": [{"Index": 0, "Speed": 0.25}]}}]),
    )
    .await;
    let ok = recv_until(&mut client, |name, body| name == "Ok" && body["Id"] == json!(3)).await;
    assert_eq!(ok, json!({"Ok": {"Id": 3}}));
    shutdown.cancel();
}

#[tokio::test]
async fn test_missed_ping_ends_connection() {
    // Arrange
    let (mut client, shutdown) = start(100).await;
    handshake(&mut client, 2).await;

    // Act: never ping.
    let error = recv_until(&mut client, |name, _| name == "Error").await;

    // Assert
    assert_eq!(error["Error"]["ErrorCode"], json!(2));
    assert_eq!(error["Error"]["Id"], json!(0));
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                None | Some(Err(_)) | Some(Ok(WsMessage::Close(_))) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server must close the connection");
    shutdown.cancel();
}
