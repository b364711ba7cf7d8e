//! End-to-end tests: [`ProtocolClient`] talking to a real `tactile-server`
//! over a localhost WebSocket.
//!
//! ```text
//! ProtocolClient ──WebSocketConnector──► ws://127.0.0.1:<ephemeral> ──► serve()
//!                                                                       └─ SimulatedDiscovery
//! ```

use std::sync::Arc;
use std::time::Duration;

use tactile_client::infrastructure::connector::WebSocketConnector;
use tactile_client::{ClientError, ClientEvent, ClientOptions, ProtocolClient};
use tactile_core::protocol::messages::{
    DeviceIndexMessage, DeviceMessageType, SpeedSubcommand, VibrateCmd,
};
use tactile_core::{ErrorCode, Message, MessageVersion};
use tactile_server::application::discovery::{DeviceEvent, DiscoveryBackend};
use tactile_server::infrastructure::simulated::{SimulatedDevice, SimulatedDiscovery};
use tactile_server::infrastructure::transport::{serve, BackendFactory};
use tactile_server::ServerOptions;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn backends() -> BackendFactory {
    Arc::new(|events: mpsc::UnboundedSender<DeviceEvent>| {
        let device = Arc::new(
            SimulatedDevice::new("Twin Wand", "twin-1")
                .with_vibrators(2)
                .with_battery(0.6),
        );
        let backend: Arc<dyn DiscoveryBackend> =
            Arc::new(SimulatedDiscovery::new("sim", events).with_device(device));
        vec![backend]
    })
}

/// Starts a server on an ephemeral port and returns a connector for it.
async fn start_server(max_ping_time_ms: u32) -> (WebSocketConnector, CancellationToken) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let shutdown = CancellationToken::new();
    let options = ServerOptions {
        server_name: "Client Test".to_string(),
        max_ping_time_ms,
    };
    tokio::spawn(serve(listener, options, backends(), shutdown.clone()));
    (WebSocketConnector::new(format!("ws://{addr}")), shutdown)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_full_session_against_real_server() {
    // Arrange
    let (connector, shutdown) = start_server(0).await;
    let (client, mut events) = ProtocolClient::connect(&connector, ClientOptions::new("e2e"))
        .await
        .expect("connect");
    assert_eq!(client.server_info().server_name, "Client Test");

    // Act: scan, which finds the device and finishes on its own.
    client.start_scanning().await.expect("start scanning");

    // Assert: both events arrive; their relative order is not fixed.
    let mut device = None;
    let mut finished = 0;
    while device.is_none() || finished == 0 {
        match next_event(&mut events).await {
            ClientEvent::DeviceAdded(added) => device = Some(added),
            ClientEvent::ScanningFinished => finished += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }
    let device = device.expect("device announced");
    assert_eq!(device.device_index, 1);
    assert!(device
        .device_messages
        .contains_key(&DeviceMessageType::VibrateCmd));

    let listed = client.request_device_list().await.expect("device list");
    assert_eq!(listed, vec![device]);

    let reply = client
        .send_device_command(Message::VibrateCmd(VibrateCmd {
            id: 0,
            device_index: 1,
            speeds: vec![
                SpeedSubcommand {
                    index: 0,
                    speed: 0.5,
                },
                SpeedSubcommand {
                    index: 1,
                    speed: 1.0,
                },
            ],
        }))
        .await
        .expect("vibrate");
    assert!(matches!(reply, Message::Ok(_)));

    let battery = client
        .send_device_command(Message::BatteryLevelCmd(DeviceIndexMessage {
            id: 0,
            device_index: 1,
        }))
        .await
        .expect("battery");
    match battery {
        Message::BatteryLevelReading(reading) => assert_eq!(reading.battery_level, 0.6),
        other => panic!("expected BatteryLevelReading, got {other:?}"),
    }

    client.stop_all_devices().await.expect("stop all");
    shutdown.cancel();
}

#[tokio::test]
async fn test_device_error_surfaces_as_server_error() {
    let (connector, shutdown) = start_server(0).await;
    let (client, _events) = ProtocolClient::connect(&connector, ClientOptions::new("e2e"))
        .await
        .expect("connect");

    let err = client
        .send_device_command(Message::StopDeviceCmd(DeviceIndexMessage {
            id: 0,
            device_index: 42,
        }))
        .await
        .unwrap_err();

    assert_eq!(err.server_code(), Some(ErrorCode::Device));
    shutdown.cancel();
}

#[tokio::test]
async fn test_v1_client_receives_widened_device_list() {
    let (connector, shutdown) = start_server(0).await;
    let options = ClientOptions::new("legacy").with_version(MessageVersion::V1);
    let (client, mut events) = ProtocolClient::connect(&connector, options)
        .await
        .expect("connect");

    client.start_scanning().await.expect("start scanning");
    while !matches!(next_event(&mut events).await, ClientEvent::DeviceAdded(_)) {}

    let listed = client.request_device_list().await.expect("device list");
    assert_eq!(listed.len(), 1);
    assert_eq!(
        listed[0].device_messages[&DeviceMessageType::VibrateCmd].feature_count,
        Some(2)
    );
    shutdown.cancel();
}

#[tokio::test]
async fn test_keep_alive_outlives_max_ping_time() {
    // Arrange
    let (connector, shutdown) = start_server(200).await;
    let (client, _events) = ProtocolClient::connect(&connector, ClientOptions::new("e2e"))
        .await
        .expect("connect");

    // Act: stay idle for three ping windows.
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Assert: the keep-alive kept the session up.
    assert_eq!(client.start_scanning().await, Ok(()));
    shutdown.cancel();
}

#[tokio::test]
async fn test_requests_fail_after_server_shutdown() {
    let (connector, shutdown) = start_server(0).await;
    let (client, mut events) = ProtocolClient::connect(&connector, ClientOptions::new("e2e"))
        .await
        .expect("connect");

    shutdown.cancel();
    loop {
        if next_event(&mut events).await == ClientEvent::Disconnected {
            break;
        }
    }

    let result = client.ping().await;
    assert!(matches!(result, Err(ClientError::Request(_))));
}
