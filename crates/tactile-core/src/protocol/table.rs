//! Static message registration table.
//!
//! Maps each wire name and schema version to the field rules the structural
//! schema checks and to the typed constructor that builds the [`Message`]
//! variant.  Adding a message means adding one row here and one variant to
//! [`Message`]; nothing is discovered at runtime.

use serde_json::Value;

use super::messages::{
    BareMessage, BatteryLevelReading, DeviceAddedMessage, DeviceAddedMessageV0,
    DeviceAddedMessageV1, DeviceIndexMessage, DeviceListMessage, DeviceListMessageV0,
    DeviceListMessageV1, ErrorMessage, LinearCmd, LogLevel, LogMessage, Message, MessageVersion,
    RequestLogMessage, RequestServerInfoMessage, RotateCmd, ServerInfoMessage,
    SingleMotorVibrateCmd, TestMessage, VibrateCmd,
};

/// JSON shape a field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    UnsignedInt,
    Number,
    String,
    Bool,
    Array,
    Object,
    /// A string drawn from a closed set.
    Enum(&'static [&'static str]),
}

impl FieldKind {
    /// Returns `true` if `value` has this shape.
    pub fn matches(self, value: &Value) -> bool {
        match self {
            FieldKind::UnsignedInt => value.as_u64().is_some_and(|v| v <= u64::from(u32::MAX)),
            FieldKind::Number => value.is_number(),
            FieldKind::String => value.is_string(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object => value.is_object(),
            FieldKind::Enum(allowed) => value.as_str().is_some_and(|s| allowed.contains(&s)),
        }
    }

    /// Short description used in schema violation text.
    pub fn describe(self) -> String {
        match self {
            FieldKind::UnsignedInt => "an unsigned 32-bit integer".to_string(),
            FieldKind::Number => "a number".to_string(),
            FieldKind::String => "a string".to_string(),
            FieldKind::Bool => "a boolean".to_string(),
            FieldKind::Array => "an array".to_string(),
            FieldKind::Object => "an object".to_string(),
            FieldKind::Enum(allowed) => format!("one of {}", allowed.join(", ")),
        }
    }
}

/// One field of a message payload (besides `Id`).
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

const fn required(name: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule {
        name,
        kind,
        required: true,
    }
}

const fn optional(name: &'static str, kind: FieldKind) -> FieldRule {
    FieldRule {
        name,
        kind,
        required: false,
    }
}

/// Typed constructor: builds the variant from the payload object.
pub type ParseFn = fn(Value) -> Result<Message, serde_json::Error>;

/// Registration row for one message shape.
#[derive(Debug, Clone, Copy)]
pub struct MessageSpec {
    pub name: &'static str,
    pub introduced: MessageVersion,
    pub fields: &'static [FieldRule],
    pub parse: ParseFn,
}

const DEVICE_INDEX: FieldRule = required("DeviceIndex", FieldKind::UnsignedInt);
const DEVICE_NAME: FieldRule = required("DeviceName", FieldKind::String);

static TABLE: &[MessageSpec] = &[
    MessageSpec {
        name: "Ok",
        introduced: MessageVersion::V0,
        fields: &[],
        parse: |v| serde_json::from_value::<BareMessage>(v).map(Message::Ok),
    },
    MessageSpec {
        name: "Error",
        introduced: MessageVersion::V0,
        fields: &[
            required("ErrorMessage", FieldKind::String),
            required("ErrorCode", FieldKind::UnsignedInt),
        ],
        parse: |v| serde_json::from_value::<ErrorMessage>(v).map(Message::Error),
    },
    MessageSpec {
        name: "Ping",
        introduced: MessageVersion::V0,
        fields: &[],
        parse: |v| serde_json::from_value::<BareMessage>(v).map(Message::Ping),
    },
    MessageSpec {
        name: "Test",
        introduced: MessageVersion::V0,
        fields: &[required("TestString", FieldKind::String)],
        parse: |v| serde_json::from_value::<TestMessage>(v).map(Message::Test),
    },
    MessageSpec {
        name: "RequestLog",
        introduced: MessageVersion::V0,
        fields: &[required("LogLevel", FieldKind::Enum(LogLevel::NAMES))],
        parse: |v| serde_json::from_value::<RequestLogMessage>(v).map(Message::RequestLog),
    },
    MessageSpec {
        name: "Log",
        introduced: MessageVersion::V0,
        fields: &[
            required("LogLevel", FieldKind::Enum(LogLevel::NAMES)),
            required("LogMessage", FieldKind::String),
        ],
        parse: |v| serde_json::from_value::<LogMessage>(v).map(Message::Log),
    },
    MessageSpec {
        name: "RequestServerInfo",
        introduced: MessageVersion::V0,
        fields: &[
            required("ClientName", FieldKind::String),
            optional("MessageVersion", FieldKind::UnsignedInt),
        ],
        parse: |v| {
            serde_json::from_value::<RequestServerInfoMessage>(v).map(Message::RequestServerInfo)
        },
    },
    MessageSpec {
        name: "ServerInfo",
        introduced: MessageVersion::V0,
        fields: &[
            required("ServerName", FieldKind::String),
            required("MessageVersion", FieldKind::UnsignedInt),
            required("MaxPingTime", FieldKind::UnsignedInt),
        ],
        parse: |v| serde_json::from_value::<ServerInfoMessage>(v).map(Message::ServerInfo),
    },
    MessageSpec {
        name: "StartScanning",
        introduced: MessageVersion::V0,
        fields: &[],
        parse: |v| serde_json::from_value::<BareMessage>(v).map(Message::StartScanning),
    },
    MessageSpec {
        name: "StopScanning",
        introduced: MessageVersion::V0,
        fields: &[],
        parse: |v| serde_json::from_value::<BareMessage>(v).map(Message::StopScanning),
    },
    MessageSpec {
        name: "ScanningFinished",
        introduced: MessageVersion::V0,
        fields: &[],
        parse: |v| serde_json::from_value::<BareMessage>(v).map(Message::ScanningFinished),
    },
    MessageSpec {
        name: "RequestDeviceList",
        introduced: MessageVersion::V0,
        fields: &[],
        parse: |v| serde_json::from_value::<BareMessage>(v).map(Message::RequestDeviceList),
    },
    MessageSpec {
        name: "DeviceList",
        introduced: MessageVersion::V0,
        fields: &[required("Devices", FieldKind::Array)],
        parse: |v| serde_json::from_value::<DeviceListMessageV0>(v).map(Message::DeviceListV0),
    },
    MessageSpec {
        name: "DeviceList",
        introduced: MessageVersion::V1,
        fields: &[required("Devices", FieldKind::Array)],
        parse: |v| serde_json::from_value::<DeviceListMessageV1>(v).map(Message::DeviceListV1),
    },
    MessageSpec {
        name: "DeviceList",
        introduced: MessageVersion::V2,
        fields: &[required("Devices", FieldKind::Array)],
        parse: |v| serde_json::from_value::<DeviceListMessage>(v).map(Message::DeviceList),
    },
    MessageSpec {
        name: "DeviceAdded",
        introduced: MessageVersion::V0,
        fields: &[
            DEVICE_INDEX,
            DEVICE_NAME,
            required("DeviceMessages", FieldKind::Array),
        ],
        parse: |v| serde_json::from_value::<DeviceAddedMessageV0>(v).map(Message::DeviceAddedV0),
    },
    MessageSpec {
        name: "DeviceAdded",
        introduced: MessageVersion::V1,
        fields: &[
            DEVICE_INDEX,
            DEVICE_NAME,
            required("DeviceMessages", FieldKind::Object),
        ],
        parse: |v| serde_json::from_value::<DeviceAddedMessageV1>(v).map(Message::DeviceAddedV1),
    },
    MessageSpec {
        name: "DeviceAdded",
        introduced: MessageVersion::V2,
        fields: &[
            DEVICE_INDEX,
            DEVICE_NAME,
            required("DeviceMessages", FieldKind::Object),
        ],
        parse: |v| serde_json::from_value::<DeviceAddedMessage>(v).map(Message::DeviceAdded),
    },
    MessageSpec {
        name: "DeviceRemoved",
        introduced: MessageVersion::V0,
        fields: &[DEVICE_INDEX],
        parse: |v| serde_json::from_value::<DeviceIndexMessage>(v).map(Message::DeviceRemoved),
    },
    MessageSpec {
        name: "StopDeviceCmd",
        introduced: MessageVersion::V0,
        fields: &[DEVICE_INDEX],
        parse: |v| serde_json::from_value::<DeviceIndexMessage>(v).map(Message::StopDeviceCmd),
    },
    MessageSpec {
        name: "StopAllDevices",
        introduced: MessageVersion::V0,
        fields: &[],
        parse: |v| serde_json::from_value::<BareMessage>(v).map(Message::StopAllDevices),
    },
    MessageSpec {
        name: "SingleMotorVibrateCmd",
        introduced: MessageVersion::V0,
        fields: &[DEVICE_INDEX, required("Speed", FieldKind::Number)],
        parse: |v| {
            serde_json::from_value::<SingleMotorVibrateCmd>(v).map(Message::SingleMotorVibrateCmd)
        },
    },
    MessageSpec {
        name: "VibrateCmd",
        introduced: MessageVersion::V1,
        fields: &[DEVICE_INDEX, required("Speeds", FieldKind::Array)],
        parse: |v| serde_json::from_value::<VibrateCmd>(v).map(Message::VibrateCmd),
    },
    MessageSpec {
        name: "RotateCmd",
        introduced: MessageVersion::V1,
        fields: &[DEVICE_INDEX, required("Rotations", FieldKind::Array)],
        parse: |v| serde_json::from_value::<RotateCmd>(v).map(Message::RotateCmd),
    },
    MessageSpec {
        name: "LinearCmd",
        introduced: MessageVersion::V1,
        fields: &[DEVICE_INDEX, required("Vectors", FieldKind::Array)],
        parse: |v| serde_json::from_value::<LinearCmd>(v).map(Message::LinearCmd),
    },
    MessageSpec {
        name: "BatteryLevelCmd",
        introduced: MessageVersion::V2,
        fields: &[DEVICE_INDEX],
        parse: |v| serde_json::from_value::<DeviceIndexMessage>(v).map(Message::BatteryLevelCmd),
    },
    MessageSpec {
        name: "BatteryLevelReading",
        introduced: MessageVersion::V2,
        fields: &[DEVICE_INDEX, required("BatteryLevel", FieldKind::Number)],
        parse: |v| {
            serde_json::from_value::<BatteryLevelReading>(v).map(Message::BatteryLevelReading)
        },
    },
];

/// Returns every registration row.
pub fn entries() -> &'static [MessageSpec] {
    TABLE
}

/// Finds the newest shape of `name` available at `version`.
///
/// Returns `None` for unknown names and for names introduced after `version`.
pub fn lookup(name: &str, version: MessageVersion) -> Option<&'static MessageSpec> {
    TABLE
        .iter()
        .filter(|spec| spec.name == name && spec.introduced <= version)
        .max_by_key(|spec| spec.introduced)
}
