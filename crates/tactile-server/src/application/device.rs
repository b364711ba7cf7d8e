//! Device adapter contract and central command validation.
//!
//! A [`DeviceAdapter`] is the server's view of one piece of hardware.  The
//! registry never hands an adapter a raw protocol message; it first turns the
//! message into a [`DeviceCommand`] and checks it with [`validate_command`],
//! so adapters only ever see commands that fit their declared features.

use async_trait::async_trait;
use tactile_core::protocol::messages::{
    DeviceMessageType, DeviceMessages, RotationSubcommand, SpeedSubcommand, VectorSubcommand,
};
use tactile_core::DeviceError;
use tokio_util::sync::CancellationToken;

/// A validated, device-addressed command.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    /// Halt every actuator.
    Stop,
    Vibrate(Vec<SpeedSubcommand>),
    Rotate(Vec<RotationSubcommand>),
    Linear(Vec<VectorSubcommand>),
    /// Read the battery charge.
    BatteryLevel,
}

impl DeviceCommand {
    /// The capability a device must declare to accept this command.
    pub fn message_type(&self) -> DeviceMessageType {
        match self {
            DeviceCommand::Stop => DeviceMessageType::StopDeviceCmd,
            DeviceCommand::Vibrate(_) => DeviceMessageType::VibrateCmd,
            DeviceCommand::Rotate(_) => DeviceMessageType::RotateCmd,
            DeviceCommand::Linear(_) => DeviceMessageType::LinearCmd,
            DeviceCommand::BatteryLevel => DeviceMessageType::BatteryLevelCmd,
        }
    }

    /// Target feature indices of a generic command, `None` otherwise.
    fn feature_indices(&self) -> Option<Vec<u32>> {
        match self {
            DeviceCommand::Vibrate(s) => Some(s.iter().map(|c| c.index).collect()),
            DeviceCommand::Rotate(r) => Some(r.iter().map(|c| c.index).collect()),
            DeviceCommand::Linear(v) => Some(v.iter().map(|c| c.index).collect()),
            DeviceCommand::Stop | DeviceCommand::BatteryLevel => None,
        }
    }
}

/// What an adapter produced for a command.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutput {
    /// The command was carried out; the client gets `Ok`.
    Done,
    /// Battery charge in `[0, 1]`.
    BatteryLevel(f64),
}

/// One connected piece of hardware.
///
/// Implementations must be cheap to share (`Arc<dyn DeviceAdapter>`) and must
/// observe `cancel` in [`handle`](DeviceAdapter::handle) when they suspend.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Human-readable name shown to the client.
    fn name(&self) -> &str;

    /// Stable identifier (e.g. a hardware address) used for deduplication.
    fn identifier(&self) -> &str;

    /// Supported message types and their attributes.
    fn message_attributes(&self) -> DeviceMessages;

    /// Hardware handshake run once before the device is registered.
    async fn initialize(&self) -> Result<(), DeviceError>;

    /// Carries out an already validated command.
    async fn handle(
        &self,
        command: DeviceCommand,
        cancel: CancellationToken,
    ) -> Result<DeviceOutput, DeviceError>;

    /// Releases the hardware.
    async fn disconnect(&self);
}

/// Checks `command` against the capabilities a device declared.
///
/// `StopDeviceCmd` is accepted by every device.  Generic commands must have
/// at least one subcommand, no more subcommands than features, and every
/// feature index in `0..feature_count`.
///
/// # Errors
///
/// Returns the [`DeviceError`] naming the first violated rule.
pub fn validate_command(
    device_index: u32,
    command: &DeviceCommand,
    attributes: &DeviceMessages,
) -> Result<(), DeviceError> {
    let kind = command.message_type();
    if kind == DeviceMessageType::StopDeviceCmd {
        return Ok(());
    }

    let declared = attributes
        .get(&kind)
        .ok_or(DeviceError::UnsupportedMessage {
            index: device_index,
            message: kind.name(),
        })?;

    let Some(indices) = command.feature_indices() else {
        return Ok(());
    };

    // A generic capability without FeatureCount addresses nothing.
    let feature_count = declared.feature_count.unwrap_or(0);
    let message = kind.name();

    if indices.is_empty() {
        return Err(DeviceError::EmptyCommand { message });
    }
    if indices.len() > feature_count as usize {
        return Err(DeviceError::TooManySubcommands {
            message,
            given: indices.len(),
            feature_count,
        });
    }
    if let Some(&index) = indices.iter().find(|&&i| i >= feature_count) {
        return Err(DeviceError::FeatureIndexOutOfRange {
            message,
            index,
            feature_count,
        });
    }
    Ok(())
}
