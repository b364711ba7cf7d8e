//! Error taxonomy for the Tactile protocol.
//!
//! Every error maps onto one of the five wire classes in [`ErrorCode`] and can
//! be turned into the `Error` message that answers the failed request.

use std::fmt;

use thiserror::Error;

use crate::protocol::messages::{ErrorCode, Message};

/// Top-level error raised while processing a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Uncategorized internal fault.
    #[error("{0}")]
    Unknown(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error("ping timeout: no ping received within {max_ping_time_ms} ms")]
    PingTimeout { max_ping_time_ms: u32 },

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

impl ProtocolError {
    /// Returns the wire error class.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::Unknown(_) => ErrorCode::Unknown,
            ProtocolError::Handshake(_) => ErrorCode::Init,
            ProtocolError::PingTimeout { .. } => ErrorCode::Ping,
            ProtocolError::Message(_) => ErrorCode::Message,
            ProtocolError::Device(_) => ErrorCode::Device,
        }
    }

    /// Builds the `Error` message answering request `id`.
    pub fn to_error_message(&self, id: u32) -> Message {
        Message::error(id, self.code(), self.to_string())
    }
}

/// Protocol-order and version-negotiation faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("{name} received before RequestServerInfo; handshake must come first")]
    NotPerformed { name: &'static str },

    #[error("handshake already completed for this session")]
    AlreadyCompleted,

    #[error("client requested message version {requested}, server supports up to {supported}")]
    UnsupportedVersion { requested: u32, supported: u32 },
}

/// Decode, schema and routing faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("schema violation: {0}")]
    Schema(String),

    #[error("element {position}: unknown message {name:?} for message version {version}")]
    UnknownMessage {
        position: usize,
        name: String,
        version: u32,
    },

    #[error("element {position} ({name}): {reason}")]
    InvalidMessage {
        position: usize,
        name: String,
        reason: String,
    },

    #[error("{name} uses id 0, which is reserved for server messages")]
    ZeroId { name: &'static str },

    #[error("{name} may only be sent by the server")]
    OutgoingOnly { name: &'static str },

    #[error("{name} is not handled by this server")]
    Unhandled { name: &'static str },

    #[error("reply with id {id} does not match any pending request")]
    UnexpectedReply { id: u32 },
}

/// Adapter-level and registry faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("no device with index {0}")]
    UnknownDevice(u32),

    #[error("device {index} does not support {message}")]
    UnsupportedMessage { index: u32, message: &'static str },

    #[error("{message} must contain at least one subcommand")]
    EmptyCommand { message: &'static str },

    #[error("{message} has {given} subcommands but the device only has {feature_count} features")]
    TooManySubcommands {
        message: &'static str,
        given: usize,
        feature_count: u32,
    },

    #[error("{message} addresses feature {index}, valid range is 0..{feature_count}")]
    FeatureIndexOutOfRange {
        message: &'static str,
        index: u32,
        feature_count: u32,
    },

    #[error("no discovery back-ends are registered")]
    NoDiscoveryBackends,

    #[error("discovery back-end {backend} failed: {reason}")]
    Discovery { backend: String, reason: String },

    #[error("device I/O failed: {0}")]
    Io(String),

    #[error("device operation cancelled")]
    Cancelled,

    #[error("failed to stop {} device(s): {}", .0.len(), DeviceFailureList(.0))]
    StopAllFailed(Vec<DeviceFailure>),
}

/// One device's failure inside a fan-out operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub index: u32,
    pub error: DeviceError,
}

impl fmt::Display for DeviceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device {}: {}", self.index, self.error)
    }
}

struct DeviceFailureList<'a>(&'a [DeviceFailure]);

impl fmt::Display for DeviceFailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_follow_error_class() {
        assert_eq!(
            ProtocolError::from(HandshakeError::AlreadyCompleted).code(),
            ErrorCode::Init
        );
        assert_eq!(
            ProtocolError::PingTimeout {
                max_ping_time_ms: 100
            }
            .code(),
            ErrorCode::Ping
        );
        assert_eq!(
            ProtocolError::from(MessageError::ZeroId { name: "Ping" }).code(),
            ErrorCode::Message
        );
        assert_eq!(
            ProtocolError::from(DeviceError::UnknownDevice(3)).code(),
            ErrorCode::Device
        );
        assert_eq!(ProtocolError::Unknown("x".into()).code(), ErrorCode::Unknown);
    }

    #[test]
    fn test_to_error_message_carries_request_id_and_text() {
        // Arrange
        let err = ProtocolError::from(DeviceError::UnknownDevice(9));

        // Act
        let msg = err.to_error_message(12);

        // Assert
        match msg {
            Message::Error(e) => {
                assert_eq!(e.id, 12);
                assert_eq!(e.error_code, ErrorCode::Device);
                assert_eq!(e.error_message, "no device with index 9");
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[test]
    fn test_stop_all_failure_lists_every_device() {
        let err = DeviceError::StopAllFailed(vec![
            DeviceFailure {
                index: 1,
                error: DeviceError::Io("unplugged".into()),
            },
            DeviceFailure {
                index: 4,
                error: DeviceError::Cancelled,
            },
        ]);

        let text = err.to_string();

        assert!(text.starts_with("failed to stop 2 device(s)"), "{text}");
        assert!(text.contains("device 1: device I/O failed: unplugged"), "{text}");
        assert!(text.contains("; device 4: device operation cancelled"), "{text}");
    }
}
