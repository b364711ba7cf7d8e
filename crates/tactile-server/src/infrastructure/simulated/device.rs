//! In-memory [`DeviceAdapter`] with configurable features and failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tactile_core::protocol::messages::{DeviceMessageType, DeviceMessages, MessageAttributes};
use tactile_core::DeviceError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::device::{DeviceAdapter, DeviceCommand, DeviceOutput};

/// A device that records every command it is asked to carry out.
pub struct SimulatedDevice {
    name: String,
    identifier: String,
    vibrators: u32,
    rotators: u32,
    linear_actuators: u32,
    battery: Option<f64>,
    fail_initialize: bool,
    delay: Duration,
    command_failure: Mutex<Option<DeviceError>>,
    handled: Mutex<Vec<DeviceCommand>>,
    connected: AtomicBool,
}

impl SimulatedDevice {
    /// A device with no features; add some with the `with_*` builders.
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
            vibrators: 0,
            rotators: 0,
            linear_actuators: 0,
            battery: None,
            fail_initialize: false,
            delay: Duration::ZERO,
            command_failure: Mutex::new(None),
            handled: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn with_vibrators(mut self, count: u32) -> Self {
        self.vibrators = count;
        self
    }

    pub fn with_rotators(mut self, count: u32) -> Self {
        self.rotators = count;
        self
    }

    pub fn with_linear_actuators(mut self, count: u32) -> Self {
        self.linear_actuators = count;
        self
    }

    /// Reports `level` (`0.0..=1.0`) for `BatteryLevelCmd`.
    pub fn with_battery(mut self, level: f64) -> Self {
        self.battery = Some(level);
        self
    }

    /// Makes every command take `delay` before completing.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes [`initialize`](DeviceAdapter::initialize) fail.
    pub fn failing_initialize(mut self) -> Self {
        self.fail_initialize = true;
        self
    }

    /// Makes every subsequent command fail with `error`.
    pub fn fail_commands(&self, error: DeviceError) {
        *self
            .command_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(error);
    }

    /// Commands carried out so far, oldest first.
    pub fn handled_commands(&self) -> Vec<DeviceCommand> {
        self.handled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceAdapter for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }

    fn message_attributes(&self) -> DeviceMessages {
        let mut attributes = DeviceMessages::new();
        attributes.insert(DeviceMessageType::StopDeviceCmd, MessageAttributes::default());
        for (kind, count) in [
            (DeviceMessageType::VibrateCmd, self.vibrators),
            (DeviceMessageType::RotateCmd, self.rotators),
            (DeviceMessageType::LinearCmd, self.linear_actuators),
        ] {
            if count > 0 {
                attributes.insert(kind, MessageAttributes::with_features(count));
            }
        }
        if self.battery.is_some() {
            attributes.insert(DeviceMessageType::BatteryLevelCmd, MessageAttributes::default());
        }
        attributes
    }

    async fn initialize(&self) -> Result<(), DeviceError> {
        if self.fail_initialize {
            return Err(DeviceError::Io(format!(
                "{} did not answer the handshake",
                self.name
            )));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn handle(
        &self,
        command: DeviceCommand,
        cancel: CancellationToken,
    ) -> Result<DeviceOutput, DeviceError> {
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        let failure = self
            .command_failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(error) = failure {
            return Err(error);
        }

        debug!("{} handling {command:?}", self.name);
        let output = match command {
            DeviceCommand::BatteryLevel => DeviceOutput::BatteryLevel(self.battery.unwrap_or(0.0)),
            _ => DeviceOutput::Done,
        };
        self.handled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(command);
        Ok(output)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}
