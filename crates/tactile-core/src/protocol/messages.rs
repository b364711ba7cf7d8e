//! All Tactile protocol message types.
//!
//! Every message is serialized as a single-key JSON object whose key is the
//! message's stable wire name and whose value holds the fields, for example
//! `{"VibrateCmd":{"Id":3,"DeviceIndex":1,"Speeds":[{"Index":0,"Speed":0.5}]}}`.
//! Field names on the wire are PascalCase.
//!
//! # Versioning
//!
//! Each variant records the [`MessageVersion`] it was introduced in.  When a
//! message must reach a client that negotiated an older version, the variant is
//! replaced by its predecessor (see [`Message::downgrade`]) until it fits.

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Message id reserved for server-originated (unsolicited) messages.
pub const SERVER_MESSAGE_ID: u32 = 0;

// ── Schema versions ───────────────────────────────────────────────────────────

/// Protocol schema revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum MessageVersion {
    V0 = 0,
    V1 = 1,
    V2 = 2,
}

impl MessageVersion {
    /// The newest version this build speaks.
    pub const CURRENT: MessageVersion = MessageVersion::V2;

    /// Returns the numeric value used on the wire.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl Default for MessageVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl TryFrom<u32> for MessageVersion {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageVersion::V0),
            1 => Ok(MessageVersion::V1),
            2 => Ok(MessageVersion::V2),
            _ => Err(()),
        }
    }
}

impl fmt::Display for MessageVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

// ── Error classes ─────────────────────────────────────────────────────────────

/// Error class carried by the `Error` message.
///
/// Serialized as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorCode {
    Unknown = 0,
    Init = 1,
    Ping = 2,
    Message = 3,
    Device = 4,
}

impl TryFrom<u8> for ErrorCode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ErrorCode::Unknown),
            1 => Ok(ErrorCode::Init),
            2 => Ok(ErrorCode::Ping),
            3 => Ok(ErrorCode::Message),
            4 => Ok(ErrorCode::Device),
            _ => Err(()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ErrorCode::Unknown => "ERROR_UNKNOWN",
            ErrorCode::Init => "ERROR_INIT",
            ErrorCode::Ping => "ERROR_PING",
            ErrorCode::Message => "ERROR_MSG",
            ErrorCode::Device => "ERROR_DEVICE",
        };
        f.write_str(tag)
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        ErrorCode::try_from(raw)
            .map_err(|_| serde::de::Error::custom(format!("unknown error code {raw}")))
    }
}

// ── Log levels ────────────────────────────────────────────────────────────────

/// Verbosity level used by `RequestLog` and `Log`.
///
/// Ordered from least to most verbose, so `Warn < Debug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogLevel {
    Off,
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Wire spellings, in declaration order.
    pub const NAMES: &'static [&'static str] =
        &["Off", "Fatal", "Error", "Warn", "Info", "Debug", "Trace"];

    /// Returns `true` if a line at `level` passes a filter set to `self`.
    pub fn allows(self, level: LogLevel) -> bool {
        self != LogLevel::Off && level != LogLevel::Off && level <= self
    }
}

// ── Device capabilities ───────────────────────────────────────────────────────

/// Device-addressed message types a device can declare support for.
///
/// Used as the key of the `DeviceMessages` capability map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceMessageType {
    StopDeviceCmd,
    SingleMotorVibrateCmd,
    VibrateCmd,
    RotateCmd,
    LinearCmd,
    BatteryLevelCmd,
}

impl DeviceMessageType {
    /// Stable wire name.
    pub fn name(self) -> &'static str {
        match self {
            DeviceMessageType::StopDeviceCmd => "StopDeviceCmd",
            DeviceMessageType::SingleMotorVibrateCmd => "SingleMotorVibrateCmd",
            DeviceMessageType::VibrateCmd => "VibrateCmd",
            DeviceMessageType::RotateCmd => "RotateCmd",
            DeviceMessageType::LinearCmd => "LinearCmd",
            DeviceMessageType::BatteryLevelCmd => "BatteryLevelCmd",
        }
    }

    /// Schema version the message type first appeared in.
    pub fn introduced(self) -> MessageVersion {
        match self {
            DeviceMessageType::StopDeviceCmd | DeviceMessageType::SingleMotorVibrateCmd => {
                MessageVersion::V0
            }
            DeviceMessageType::VibrateCmd
            | DeviceMessageType::RotateCmd
            | DeviceMessageType::LinearCmd => MessageVersion::V1,
            DeviceMessageType::BatteryLevelCmd => MessageVersion::V2,
        }
    }

    /// Returns `true` for multi-actuator commands bounded by a feature count.
    pub fn is_generic(self) -> bool {
        matches!(
            self,
            DeviceMessageType::VibrateCmd
                | DeviceMessageType::RotateCmd
                | DeviceMessageType::LinearCmd
        )
    }
}

/// Attributes of one supported message type (version 2 shape).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct MessageAttributes {
    /// Number of independently addressable actuators or sensors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_count: Option<u32>,
    /// Number of discrete steps each feature supports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_count: Option<Vec<u32>>,
}

impl MessageAttributes {
    /// Attributes for a generic command with `feature_count` features.
    pub fn with_features(feature_count: u32) -> Self {
        Self {
            feature_count: Some(feature_count),
            step_count: None,
        }
    }
}

/// Attributes of one supported message type (version 1 shape).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct MessageAttributesV1 {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_count: Option<u32>,
}

impl From<MessageAttributes> for MessageAttributesV1 {
    fn from(attributes: MessageAttributes) -> Self {
        Self {
            feature_count: attributes.feature_count,
        }
    }
}

/// Capability map advertised for a device.
pub type DeviceMessages = BTreeMap<DeviceMessageType, MessageAttributes>;

/// Device entry inside `DeviceList` (version 2 shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceInfo {
    pub device_index: u32,
    pub device_name: String,
    pub device_messages: DeviceMessages,
}

/// Device entry inside `DeviceList` (version 1 shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceInfoV1 {
    pub device_index: u32,
    pub device_name: String,
    pub device_messages: BTreeMap<DeviceMessageType, MessageAttributesV1>,
}

/// Device entry inside `DeviceList` (version 0 shape: message names only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceInfoV0 {
    pub device_index: u32,
    pub device_name: String,
    pub device_messages: Vec<DeviceMessageType>,
}

impl From<DeviceInfo> for DeviceInfoV1 {
    fn from(info: DeviceInfo) -> Self {
        Self {
            device_index: info.device_index,
            device_name: info.device_name,
            device_messages: info
                .device_messages
                .into_iter()
                .map(|(kind, attributes)| (kind, attributes.into()))
                .collect(),
        }
    }
}

impl From<DeviceInfoV1> for DeviceInfoV0 {
    fn from(info: DeviceInfoV1) -> Self {
        Self {
            device_index: info.device_index,
            device_name: info.device_name,
            device_messages: info.device_messages.into_keys().collect(),
        }
    }
}

// Older shapes widen losslessly except for what they never carried.

impl From<DeviceInfoV1> for DeviceInfo {
    fn from(info: DeviceInfoV1) -> Self {
        Self {
            device_index: info.device_index,
            device_name: info.device_name,
            device_messages: info
                .device_messages
                .into_iter()
                .map(|(kind, attributes)| {
                    let attributes = MessageAttributes {
                        feature_count: attributes.feature_count,
                        step_count: None,
                    };
                    (kind, attributes)
                })
                .collect(),
        }
    }
}

impl From<DeviceInfoV0> for DeviceInfo {
    fn from(info: DeviceInfoV0) -> Self {
        Self {
            device_index: info.device_index,
            device_name: info.device_name,
            device_messages: info
                .device_messages
                .into_iter()
                .map(|kind| (kind, MessageAttributes::default()))
                .collect(),
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// Payload for messages that carry nothing but an id
/// (`Ok`, `Ping`, `StartScanning`, `StopScanning`, `ScanningFinished`,
/// `RequestDeviceList`, `StopAllDevices`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct BareMessage {
    pub id: u32,
}

impl BareMessage {
    pub fn new(id: u32) -> Self {
        Self { id }
    }
}

/// ERROR: a request failed, or the server raised an error on its own (id 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ErrorMessage {
    pub id: u32,
    /// Human-readable description.
    pub error_message: String,
    /// Error class.
    pub error_code: ErrorCode,
}

/// TEST: echoed back verbatim by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TestMessage {
    pub id: u32,
    pub test_string: String,
}

/// REQUEST_LOG: client asks for server log lines at or above a verbosity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RequestLogMessage {
    pub id: u32,
    pub log_level: LogLevel,
}

/// LOG: one forwarded server log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct LogMessage {
    pub id: u32,
    pub log_level: LogLevel,
    pub log_message: String,
}

/// REQUEST_SERVER_INFO: the handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RequestServerInfoMessage {
    pub id: u32,
    /// Human-readable client name.
    pub client_name: String,
    /// Schema version the client speaks; absent means the current version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_version: Option<u32>,
}

/// SERVER_INFO: the handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ServerInfoMessage {
    pub id: u32,
    pub server_name: String,
    /// The server's own (current) schema version.
    pub message_version: u32,
    /// Maximum interval between pings in milliseconds; 0 disables the check.
    pub max_ping_time: u32,
}

/// DEVICE_LIST (version 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceListMessage {
    pub id: u32,
    pub devices: Vec<DeviceInfo>,
}

/// DEVICE_LIST (version 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceListMessageV1 {
    pub id: u32,
    pub devices: Vec<DeviceInfoV1>,
}

/// DEVICE_LIST (version 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceListMessageV0 {
    pub id: u32,
    pub devices: Vec<DeviceInfoV0>,
}

/// DEVICE_ADDED (version 2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceAddedMessage {
    pub id: u32,
    pub device_index: u32,
    pub device_name: String,
    pub device_messages: DeviceMessages,
}

/// DEVICE_ADDED (version 1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceAddedMessageV1 {
    pub id: u32,
    pub device_index: u32,
    pub device_name: String,
    pub device_messages: BTreeMap<DeviceMessageType, MessageAttributesV1>,
}

/// DEVICE_ADDED (version 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceAddedMessageV0 {
    pub id: u32,
    pub device_index: u32,
    pub device_name: String,
    pub device_messages: Vec<DeviceMessageType>,
}

impl From<DeviceAddedMessage> for DeviceAddedMessageV1 {
    fn from(msg: DeviceAddedMessage) -> Self {
        let info = DeviceInfoV1::from(DeviceInfo {
            device_index: msg.device_index,
            device_name: msg.device_name,
            device_messages: msg.device_messages,
        });
        Self {
            id: msg.id,
            device_index: info.device_index,
            device_name: info.device_name,
            device_messages: info.device_messages,
        }
    }
}

impl From<DeviceAddedMessageV1> for DeviceAddedMessageV0 {
    fn from(msg: DeviceAddedMessageV1) -> Self {
        Self {
            id: msg.id,
            device_index: msg.device_index,
            device_name: msg.device_name,
            device_messages: msg.device_messages.into_keys().collect(),
        }
    }
}

impl From<DeviceListMessage> for DeviceListMessageV1 {
    fn from(msg: DeviceListMessage) -> Self {
        Self {
            id: msg.id,
            devices: msg.devices.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<DeviceListMessageV1> for DeviceListMessageV0 {
    fn from(msg: DeviceListMessageV1) -> Self {
        Self {
            id: msg.id,
            devices: msg.devices.into_iter().map(Into::into).collect(),
        }
    }
}

/// Payload for messages addressed to a single device by index
/// (`DeviceRemoved`, `StopDeviceCmd`, `BatteryLevelCmd`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DeviceIndexMessage {
    pub id: u32,
    pub device_index: u32,
}

/// SINGLE_MOTOR_VIBRATE_CMD (version 0): every vibrator at one speed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct SingleMotorVibrateCmd {
    pub id: u32,
    pub device_index: u32,
    pub speed: f64,
}

/// One vibrator speed inside a [`VibrateCmd`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct SpeedSubcommand {
    pub index: u32,
    /// Normalised speed in `[0, 1]`.
    pub speed: f64,
}

/// VIBRATE_CMD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct VibrateCmd {
    pub id: u32,
    pub device_index: u32,
    pub speeds: Vec<SpeedSubcommand>,
}

/// One rotator setting inside a [`RotateCmd`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RotationSubcommand {
    pub index: u32,
    pub speed: f64,
    pub clockwise: bool,
}

/// ROTATE_CMD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RotateCmd {
    pub id: u32,
    pub device_index: u32,
    pub rotations: Vec<RotationSubcommand>,
}

/// One linear movement inside a [`LinearCmd`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct VectorSubcommand {
    pub index: u32,
    /// Movement duration in milliseconds.
    pub duration: u32,
    /// Target position in `[0, 1]`.
    pub position: f64,
}

/// LINEAR_CMD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct LinearCmd {
    pub id: u32,
    pub device_index: u32,
    pub vectors: Vec<VectorSubcommand>,
}

/// BATTERY_LEVEL_READING: reply to `BatteryLevelCmd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct BatteryLevelReading {
    pub id: u32,
    pub device_index: u32,
    /// Charge in `[0, 1]`.
    pub battery_level: f64,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// All valid Tactile messages.
///
/// Versioned shapes of the same wire message (e.g. `DeviceAdded`) are separate
/// variants; [`Message::name`] returns the shared wire name.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Ok(BareMessage),
    Error(ErrorMessage),
    Ping(BareMessage),
    Test(TestMessage),
    RequestLog(RequestLogMessage),
    Log(LogMessage),
    RequestServerInfo(RequestServerInfoMessage),
    ServerInfo(ServerInfoMessage),
    StartScanning(BareMessage),
    StopScanning(BareMessage),
    ScanningFinished(BareMessage),
    RequestDeviceList(BareMessage),
    DeviceList(DeviceListMessage),
    DeviceListV1(DeviceListMessageV1),
    DeviceListV0(DeviceListMessageV0),
    DeviceAdded(DeviceAddedMessage),
    DeviceAddedV1(DeviceAddedMessageV1),
    DeviceAddedV0(DeviceAddedMessageV0),
    DeviceRemoved(DeviceIndexMessage),
    StopDeviceCmd(DeviceIndexMessage),
    StopAllDevices(BareMessage),
    SingleMotorVibrateCmd(SingleMotorVibrateCmd),
    VibrateCmd(VibrateCmd),
    RotateCmd(RotateCmd),
    LinearCmd(LinearCmd),
    BatteryLevelCmd(DeviceIndexMessage),
    BatteryLevelReading(BatteryLevelReading),
}

/// Runs `$body` against the payload of any variant, binding it to `$m`.
macro_rules! with_payload {
    ($msg:expr, $m:ident => $body:expr) => {
        match $msg {
            Message::Ok($m) => $body,
            Message::Error($m) => $body,
            Message::Ping($m) => $body,
            Message::Test($m) => $body,
            Message::RequestLog($m) => $body,
            Message::Log($m) => $body,
            Message::RequestServerInfo($m) => $body,
            Message::ServerInfo($m) => $body,
            Message::StartScanning($m) => $body,
            Message::StopScanning($m) => $body,
            Message::ScanningFinished($m) => $body,
            Message::RequestDeviceList($m) => $body,
            Message::DeviceList($m) => $body,
            Message::DeviceListV1($m) => $body,
            Message::DeviceListV0($m) => $body,
            Message::DeviceAdded($m) => $body,
            Message::DeviceAddedV1($m) => $body,
            Message::DeviceAddedV0($m) => $body,
            Message::DeviceRemoved($m) => $body,
            Message::StopDeviceCmd($m) => $body,
            Message::StopAllDevices($m) => $body,
            Message::SingleMotorVibrateCmd($m) => $body,
            Message::VibrateCmd($m) => $body,
            Message::RotateCmd($m) => $body,
            Message::LinearCmd($m) => $body,
            Message::BatteryLevelCmd($m) => $body,
            Message::BatteryLevelReading($m) => $body,
        }
    };
}

impl Message {
    /// `Ok` reply for request `id`.
    pub fn ok(id: u32) -> Self {
        Message::Ok(BareMessage::new(id))
    }

    /// `Error` message with the given class and text.
    pub fn error(id: u32, error_code: ErrorCode, error_message: impl Into<String>) -> Self {
        Message::Error(ErrorMessage {
            id,
            error_message: error_message.into(),
            error_code,
        })
    }

    /// Returns the message id.
    pub fn id(&self) -> u32 {
        with_payload!(self, m => m.id)
    }

    /// Overwrites the message id.
    pub fn set_id(&mut self, id: u32) {
        with_payload!(self, m => m.id = id)
    }

    /// Returns the stable wire name.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Ok(_) => "Ok",
            Message::Error(_) => "Error",
            Message::Ping(_) => "Ping",
            Message::Test(_) => "Test",
            Message::RequestLog(_) => "RequestLog",
            Message::Log(_) => "Log",
            Message::RequestServerInfo(_) => "RequestServerInfo",
            Message::ServerInfo(_) => "ServerInfo",
            Message::StartScanning(_) => "StartScanning",
            Message::StopScanning(_) => "StopScanning",
            Message::ScanningFinished(_) => "ScanningFinished",
            Message::RequestDeviceList(_) => "RequestDeviceList",
            Message::DeviceList(_) | Message::DeviceListV1(_) | Message::DeviceListV0(_) => {
                "DeviceList"
            }
            Message::DeviceAdded(_) | Message::DeviceAddedV1(_) | Message::DeviceAddedV0(_) => {
                "DeviceAdded"
            }
            Message::DeviceRemoved(_) => "DeviceRemoved",
            Message::StopDeviceCmd(_) => "StopDeviceCmd",
            Message::StopAllDevices(_) => "StopAllDevices",
            Message::SingleMotorVibrateCmd(_) => "SingleMotorVibrateCmd",
            Message::VibrateCmd(_) => "VibrateCmd",
            Message::RotateCmd(_) => "RotateCmd",
            Message::LinearCmd(_) => "LinearCmd",
            Message::BatteryLevelCmd(_) => "BatteryLevelCmd",
            Message::BatteryLevelReading(_) => "BatteryLevelReading",
        }
    }

    /// Returns the schema version this variant was introduced in.
    pub fn introduced(&self) -> MessageVersion {
        match self {
            Message::DeviceList(_)
            | Message::DeviceAdded(_)
            | Message::BatteryLevelCmd(_)
            | Message::BatteryLevelReading(_) => MessageVersion::V2,
            Message::DeviceListV1(_)
            | Message::DeviceAddedV1(_)
            | Message::VibrateCmd(_)
            | Message::RotateCmd(_)
            | Message::LinearCmd(_) => MessageVersion::V1,
            _ => MessageVersion::V0,
        }
    }

    /// Returns `true` for messages only the server may originate.
    pub fn is_server_only(&self) -> bool {
        matches!(
            self,
            Message::Ok(_)
                | Message::Error(_)
                | Message::Log(_)
                | Message::ServerInfo(_)
                | Message::ScanningFinished(_)
                | Message::DeviceList(_)
                | Message::DeviceListV1(_)
                | Message::DeviceListV0(_)
                | Message::DeviceAdded(_)
                | Message::DeviceAddedV1(_)
                | Message::DeviceAddedV0(_)
                | Message::DeviceRemoved(_)
                | Message::BatteryLevelReading(_)
        )
    }

    /// Returns the device index for device-addressed messages.
    pub fn device_index(&self) -> Option<u32> {
        match self {
            Message::StopDeviceCmd(m) | Message::BatteryLevelCmd(m) | Message::DeviceRemoved(m) => {
                Some(m.device_index)
            }
            Message::SingleMotorVibrateCmd(m) => Some(m.device_index),
            Message::VibrateCmd(m) => Some(m.device_index),
            Message::RotateCmd(m) => Some(m.device_index),
            Message::LinearCmd(m) => Some(m.device_index),
            Message::BatteryLevelReading(m) => Some(m.device_index),
            Message::DeviceAdded(m) => Some(m.device_index),
            Message::DeviceAddedV1(m) => Some(m.device_index),
            Message::DeviceAddedV0(m) => Some(m.device_index),
            _ => None,
        }
    }

    /// Replaces this message with its predecessor variant, or hands it back
    /// unchanged when it has none.
    fn into_predecessor(self) -> Result<Message, Message> {
        match self {
            Message::DeviceAdded(m) => Ok(Message::DeviceAddedV1(m.into())),
            Message::DeviceAddedV1(m) => Ok(Message::DeviceAddedV0(m.into())),
            Message::DeviceList(m) => Ok(Message::DeviceListV1(m.into())),
            Message::DeviceListV1(m) => Ok(Message::DeviceListV0(m.into())),
            other => Err(other),
        }
    }

    /// Narrows the message to a shape a `target`-version peer understands.
    ///
    /// Predecessors are applied recursively.  A message with no predecessor
    /// is returned as is.
    pub fn downgrade(self, target: MessageVersion) -> Message {
        let mut msg = self;
        while msg.introduced() > target {
            match msg.into_predecessor() {
                Ok(older) => msg = older,
                Err(unchanged) => {
                    tracing::debug!(
                        "{} (v{}) has no predecessor for v{target}",
                        unchanged.name(),
                        unchanged.introduced()
                    );
                    return unchanged;
                }
            }
        }
        msg
    }

    /// Checks value ranges that the wire types alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns a description of the first offending field.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Message::SingleMotorVibrateCmd(m) => check_unit("Speed", m.speed),
            Message::VibrateCmd(m) => m
                .speeds
                .iter()
                .try_for_each(|s| check_unit("Speed", s.speed)),
            Message::RotateCmd(m) => m
                .rotations
                .iter()
                .try_for_each(|r| check_unit("Speed", r.speed)),
            Message::LinearCmd(m) => m
                .vectors
                .iter()
                .try_for_each(|v| check_unit("Position", v.position)),
            Message::BatteryLevelReading(m) => check_unit("BatteryLevel", m.battery_level),
            _ => Ok(()),
        }
    }
}

fn check_unit(field: &str, value: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{field} must be within [0, 1], got {value}"))
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        let name = self.name();
        with_payload!(self, m => map.serialize_entry(name, m)?);
        map.end()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
