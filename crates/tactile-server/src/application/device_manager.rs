//! Device registry and command routing.
//!
//! The [`DeviceManager`] is the server's in-memory database of devices.  Each
//! connected device gets a session-stable index that the client uses to
//! address it.
//!
//! # Device lifecycle (for beginners)
//!
//! ```text
//!   DeviceFound ──► initialize() ──► registered (index N) ──► DeviceAdded
//!                                          │
//!   DeviceRemoved ─────────────────────────┴──► retired (index N kept) ──► DeviceRemoved
//!                                                    │
//!   DeviceFound (same identifier) ──► initialize() ──┴──► registered (index N again)
//! ```
//!
//! # Locking discipline
//!
//! All map reads and writes happen under one `std::sync::Mutex`, and every
//! read-then-write sequence ("is it already connected? then insert") runs as
//! one critical section.  The lock is never held across an `.await`; adapters
//! are cloned out of the map before any device I/O starts.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tactile_core::protocol::messages::{
    BatteryLevelReading, DeviceAddedMessage, DeviceIndexMessage, DeviceInfo, DeviceListMessage,
    DeviceMessageType, DeviceMessages, MessageVersion, SpeedSubcommand,
};
use tactile_core::{
    DeviceError, DeviceFailure, Message, MessageError, ProtocolError, SERVER_MESSAGE_ID,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::device::{validate_command, DeviceAdapter, DeviceCommand, DeviceOutput};
use super::discovery::{DeviceEvent, DiscoveryBackend};
use super::log::ClientLogger;
use super::scan::ScanCoordinator;
use super::session::ServerEvent;

struct DeviceEntry {
    identifier: String,
    name: String,
    attributes: DeviceMessages,
    adapter: Arc<dyn DeviceAdapter>,
}

#[derive(Default)]
struct Registry {
    connected: BTreeMap<u32, DeviceEntry>,
    /// Indices of removed devices, by identifier, kept for reuse.
    retired: BTreeMap<String, BTreeSet<u32>>,
}

/// Outcome of the atomic "deduplicate then insert" step.
enum Registration {
    Duplicate,
    Registered(u32),
}

/// Registry of connected devices plus the scan coordinator.
pub struct DeviceManager {
    registry: Mutex<Registry>,
    next_index: AtomicU32,
    version: Arc<AtomicU32>,
    scan: ScanCoordinator,
    events: mpsc::UnboundedSender<ServerEvent>,
    device_events: mpsc::UnboundedSender<DeviceEvent>,
    logger: ClientLogger,
}

impl DeviceManager {
    /// Creates a manager and the receiving end of its device event channel.
    ///
    /// `version` is the session's negotiated schema version; it is read every
    /// time a capability map is advertised.
    pub fn new(
        version: Arc<AtomicU32>,
        events: mpsc::UnboundedSender<ServerEvent>,
        logger: ClientLogger,
    ) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (device_events, device_rx) = mpsc::unbounded_channel();
        let manager = Self {
            registry: Mutex::new(Registry::default()),
            next_index: AtomicU32::new(1),
            version,
            scan: ScanCoordinator::new(events.clone()),
            events,
            device_events,
            logger,
        };
        (manager, device_rx)
    }

    /// Sender that discovery back-ends push their events onto.
    pub fn device_event_sender(&self) -> mpsc::UnboundedSender<DeviceEvent> {
        self.device_events.clone()
    }

    pub fn add_backend(&self, backend: Arc<dyn DiscoveryBackend>) {
        self.scan.add_backend(backend);
    }

    pub fn scan(&self) -> &ScanCoordinator {
        &self.scan
    }

    /// Consumes device events until `shutdown` fires or the channel closes.
    pub fn spawn_event_pump(
        self: &Arc<Self>,
        mut device_rx: mpsc::UnboundedReceiver<DeviceEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = device_rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                debug!("device event: {event:?}");
                match event {
                    DeviceEvent::DeviceFound(adapter) => manager.on_device_discovered(adapter).await,
                    DeviceEvent::DeviceRemoved { identifier } => {
                        manager.on_device_removed(&identifier).await
                    }
                    DeviceEvent::ScanningFinished { backend } => {
                        manager.scan.on_backend_finished(&backend)
                    }
                }
            }
            debug!("device event pump stopped");
        })
    }

    // ── Discovery callbacks ───────────────────────────────────────────────────

    /// Registers a newly found device and announces it to the client.
    ///
    /// Devices with an empty identifier, or whose identifier is already
    /// connected, are ignored.  A device seen before reuses its old index.
    pub async fn on_device_discovered(&self, adapter: Arc<dyn DeviceAdapter>) {
        let identifier = adapter.identifier().to_string();
        if identifier.is_empty() {
            debug!("ignoring device {:?} with empty identifier", adapter.name());
            return;
        }
        if self.is_connected(&identifier) {
            debug!("ignoring duplicate report for {identifier}");
            return;
        }

        if let Err(e) = adapter.initialize().await {
            self.logger.warn(format!(
                "device {} ({identifier}) failed to initialize: {e}",
                adapter.name()
            ));
            return;
        }

        let name = adapter.name().to_string();
        let attributes = adapter.message_attributes();
        let registration = {
            let mut registry = self.lock();
            if registry
                .connected
                .values()
                .any(|entry| entry.identifier == identifier)
            {
                Registration::Duplicate
            } else {
                let index = self.take_index(&mut registry, &identifier);
                registry.connected.insert(
                    index,
                    DeviceEntry {
                        identifier: identifier.clone(),
                        name: name.clone(),
                        attributes: attributes.clone(),
                        adapter,
                    },
                );
                Registration::Registered(index)
            }
        };

        let Registration::Registered(index) = registration else {
            debug!("{identifier} connected concurrently; dropping second report");
            return;
        };

        self.logger
            .info(format!("device {name} ({identifier}) added as index {index}"));
        let added = Message::DeviceAdded(DeviceAddedMessage {
            id: SERVER_MESSAGE_ID,
            device_index: index,
            device_name: name,
            device_messages: advertised(&attributes, self.version()),
        });
        let _ = self.events.send(ServerEvent::Message(added));
    }

    /// Removes every connected record with `identifier` and announces each
    /// removal.
    pub async fn on_device_removed(&self, identifier: &str) {
        let removed: Vec<(u32, DeviceEntry)> = {
            let mut registry = self.lock();
            let indices: Vec<u32> = registry
                .connected
                .iter()
                .filter(|(_, entry)| entry.identifier == identifier)
                .map(|(&index, _)| index)
                .collect();
            let mut removed = Vec::with_capacity(indices.len());
            for index in indices {
                if let Some(entry) = registry.connected.remove(&index) {
                    registry
                        .retired
                        .entry(identifier.to_string())
                        .or_default()
                        .insert(index);
                    removed.push((index, entry));
                }
            }
            removed
        };

        match removed.len() {
            0 => error!("removal reported for {identifier}, but no connected device has it"),
            1 => {}
            n => error!("{n} connected devices shared identifier {identifier}"),
        }

        for (index, entry) in removed {
            self.logger.info(format!(
                "device {} ({identifier}) at index {index} removed",
                entry.name
            ));
            let msg = Message::DeviceRemoved(DeviceIndexMessage {
                id: SERVER_MESSAGE_ID,
                device_index: index,
            });
            let _ = self.events.send(ServerEvent::Message(msg));
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    /// Connected devices with capabilities filtered for the negotiated version.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let version = self.version();
        self.lock()
            .connected
            .iter()
            .map(|(&index, entry)| DeviceInfo {
                device_index: index,
                device_name: entry.name.clone(),
                device_messages: advertised(&entry.attributes, version),
            })
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.lock().connected.len()
    }

    // ── Command routing ───────────────────────────────────────────────────────

    /// Routes a request the session did not handle itself.
    ///
    /// # Errors
    ///
    /// `ERROR_DEVICE` for device faults and unknown indices, `ERROR_MSG` for
    /// message types this server does not route.
    pub async fn dispatch(
        &self,
        msg: Message,
        cancel: &CancellationToken,
    ) -> Result<Message, ProtocolError> {
        match msg {
            Message::StartScanning(m) => {
                self.scan.start().await?;
                Ok(Message::ok(m.id))
            }
            Message::StopScanning(m) => {
                self.scan.stop().await?;
                Ok(Message::ok(m.id))
            }
            Message::StopAllDevices(m) => {
                self.stop_all_devices(cancel).await?;
                Ok(Message::ok(m.id))
            }
            Message::RequestDeviceList(m) => Ok(Message::DeviceList(DeviceListMessage {
                id: m.id,
                devices: self.list_devices(),
            })),
            Message::StopDeviceCmd(m) => {
                self.forward(m.id, m.device_index, DeviceCommand::Stop, cancel)
                    .await
            }
            Message::SingleMotorVibrateCmd(m) => {
                let command = self.upgrade_single_motor(m.device_index, m.speed)?;
                self.forward(m.id, m.device_index, command, cancel).await
            }
            Message::VibrateCmd(m) => {
                self.forward(m.id, m.device_index, DeviceCommand::Vibrate(m.speeds), cancel)
                    .await
            }
            Message::RotateCmd(m) => {
                self.forward(m.id, m.device_index, DeviceCommand::Rotate(m.rotations), cancel)
                    .await
            }
            Message::LinearCmd(m) => {
                self.forward(m.id, m.device_index, DeviceCommand::Linear(m.vectors), cancel)
                    .await
            }
            Message::BatteryLevelCmd(m) => {
                self.forward(m.id, m.device_index, DeviceCommand::BatteryLevel, cancel)
                    .await
            }
            other => Err(MessageError::Unhandled { name: other.name() }.into()),
        }
    }

    /// Sends a stop command to every connected device.
    ///
    /// Failures do not end the iteration; they are collected per device.
    ///
    /// # Errors
    ///
    /// [`DeviceError::StopAllFailed`] listing every device that failed.
    pub async fn stop_all_devices(&self, cancel: &CancellationToken) -> Result<(), DeviceError> {
        let targets: Vec<(u32, Arc<dyn DeviceAdapter>)> = self
            .lock()
            .connected
            .iter()
            .map(|(&index, entry)| (index, Arc::clone(&entry.adapter)))
            .collect();

        let mut failures = Vec::new();
        for (index, adapter) in targets {
            if let Err(error) = run_command(adapter.as_ref(), DeviceCommand::Stop, cancel).await {
                warn!("failed to stop device {index}: {error}");
                failures.push(DeviceFailure { index, error });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(DeviceError::StopAllFailed(failures))
        }
    }

    /// Disconnects every adapter and empties the registry.
    pub async fn disconnect_all(&self) {
        let entries: Vec<DeviceEntry> = {
            let mut registry = self.lock();
            std::mem::take(&mut registry.connected).into_values().collect()
        };
        for entry in entries {
            debug!("disconnecting {}", entry.identifier);
            entry.adapter.disconnect().await;
        }
    }

    async fn forward(
        &self,
        id: u32,
        device_index: u32,
        command: DeviceCommand,
        cancel: &CancellationToken,
    ) -> Result<Message, ProtocolError> {
        let (adapter, attributes) = {
            let registry = self.lock();
            let entry = registry
                .connected
                .get(&device_index)
                .ok_or(DeviceError::UnknownDevice(device_index))?;
            (Arc::clone(&entry.adapter), entry.attributes.clone())
        };

        validate_command(device_index, &command, &attributes)?;

        match run_command(adapter.as_ref(), command, cancel).await? {
            DeviceOutput::Done => Ok(Message::ok(id)),
            DeviceOutput::BatteryLevel(battery_level) => {
                Ok(Message::BatteryLevelReading(BatteryLevelReading {
                    id,
                    device_index,
                    battery_level,
                }))
            }
        }
    }

    /// Turns a legacy single-speed command into a `VibrateCmd` that drives
    /// every vibrator of the device at the same speed.
    fn upgrade_single_motor(&self, device_index: u32, speed: f64) -> Result<DeviceCommand, DeviceError> {
        let registry = self.lock();
        let entry = registry
            .connected
            .get(&device_index)
            .ok_or(DeviceError::UnknownDevice(device_index))?;
        let feature_count = entry
            .attributes
            .get(&DeviceMessageType::VibrateCmd)
            .and_then(|a| a.feature_count)
            .ok_or(DeviceError::UnsupportedMessage {
                index: device_index,
                message: DeviceMessageType::SingleMotorVibrateCmd.name(),
            })?;
        Ok(DeviceCommand::Vibrate(
            (0..feature_count)
                .map(|index| SpeedSubcommand { index, speed })
                .collect(),
        ))
    }

    fn is_connected(&self, identifier: &str) -> bool {
        self.lock()
            .connected
            .values()
            .any(|entry| entry.identifier == identifier)
    }

    /// Picks the index for `identifier`: its lowest retired index, or a new one.
    fn take_index(&self, registry: &mut Registry, identifier: &str) -> u32 {
        if let Some(indices) = registry.retired.get_mut(identifier) {
            if indices.len() > 1 {
                error!(
                    "{} retired indices recorded for {identifier}; reusing the lowest",
                    indices.len()
                );
            }
            let reused = indices.pop_first();
            if indices.is_empty() {
                registry.retired.remove(identifier);
            }
            if let Some(index) = reused {
                return index;
            }
        }
        self.next_index.fetch_add(1, Ordering::SeqCst)
    }

    fn version(&self) -> MessageVersion {
        MessageVersion::try_from(self.version.load(Ordering::SeqCst))
            .unwrap_or(MessageVersion::CURRENT)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs one command, giving up as soon as `cancel` fires.
async fn run_command(
    adapter: &dyn DeviceAdapter,
    command: DeviceCommand,
    cancel: &CancellationToken,
) -> Result<DeviceOutput, DeviceError> {
    if cancel.is_cancelled() {
        return Err(DeviceError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeviceError::Cancelled),
        result = adapter.handle(command, cancel.clone()) => result,
    }
}

/// Capability map a `version` client is allowed to see.
///
/// Message types newer than `version` are dropped.  `StopDeviceCmd` is always
/// present, and `SingleMotorVibrateCmd` is present whenever the device can
/// vibrate.
pub fn advertised(attributes: &DeviceMessages, version: MessageVersion) -> DeviceMessages {
    let mut visible: DeviceMessages = attributes
        .iter()
        .filter(|(kind, _)| kind.introduced() <= version)
        .map(|(kind, attrs)| (*kind, attrs.clone()))
        .collect();
    visible.entry(DeviceMessageType::StopDeviceCmd).or_default();
    if attributes.contains_key(&DeviceMessageType::VibrateCmd) {
        visible
            .entry(DeviceMessageType::SingleMotorVibrateCmd)
            .or_default();
    }
    visible
}

// ── Tests ─────────────────────────────────────────────────────────────────────
