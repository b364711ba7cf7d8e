//! JSON wire codec: encode and decode batches of [`Message`]s.
//!
//! # Wire format
//!
//! A frame is UTF-8 JSON text holding an array of single-key objects:
//!
//! ```text
//! [{"RequestServerInfo":{"Id":1,"ClientName":"demo","MessageVersion":2}},
//!  {"Ping":{"Id":2}}]
//! ```
//!
//! # Failure model
//!
//! Decoding runs on untrusted input and never panics or returns early with an
//! error.  Each batch yields a `Vec` of per-element results:
//!
//! - unparsable text or a schema violation yields exactly one [`DecodeError`]
//!   and nothing else;
//! - otherwise every element is decoded independently, so one bad element does
//!   not hide the good ones around it.
//!
//! Encoding never fails.  Messages newer than the peer's version are replaced
//! by their predecessors before serialization.

use serde_json::Value;
use thiserror::Error;

use super::messages::{ErrorCode, Message, MessageVersion, SERVER_MESSAGE_ID};
use super::{schema, table};
use crate::error::{MessageError, ProtocolError};

/// A decode failure for one element (or for the whole batch).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error}")]
pub struct DecodeError {
    /// Id of the offending element when it could be read, otherwise 0.
    pub id: u32,
    pub error: MessageError,
}

impl DecodeError {
    fn batch(error: MessageError) -> Self {
        Self {
            id: SERVER_MESSAGE_ID,
            error,
        }
    }

    /// Builds the `ERROR_MSG` reply for this failure.
    pub fn to_error_message(&self) -> Message {
        Message::error(self.id, ErrorCode::Message, self.error.to_string())
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(err: DecodeError) -> Self {
        ProtocolError::Message(err.error)
    }
}

/// Decodes a frame produced by a peer speaking `version`.
pub fn decode_messages(text: &str, version: MessageVersion) -> Vec<Result<Message, DecodeError>> {
    let batch: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!("rejecting unparsable frame: {e}");
            return vec![Err(DecodeError::batch(MessageError::InvalidJson(
                e.to_string(),
            )))];
        }
    };

    let elements = match schema::validate_batch(&batch, version) {
        Ok(elements) => elements,
        Err(e) => {
            tracing::debug!("rejecting frame: {e}");
            return vec![Err(DecodeError::batch(e))];
        }
    };

    elements
        .iter()
        .enumerate()
        .map(|(position, element)| decode_element(position, element, version))
        .collect()
}

fn decode_element(
    position: usize,
    element: &Value,
    version: MessageVersion,
) -> Result<Message, DecodeError> {
    // The schema guarantees a single-key object with an object payload.
    let Some((name, payload)) = element.as_object().and_then(|o| o.iter().next()) else {
        return Err(DecodeError::batch(MessageError::Schema(format!(
            "element {position} has no message name"
        ))));
    };
    let id = payload
        .get("Id")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(SERVER_MESSAGE_ID);

    let fail = |error| DecodeError { id, error };
    let invalid = |reason: String| {
        fail(MessageError::InvalidMessage {
            position,
            name: name.clone(),
            reason,
        })
    };

    let spec = table::lookup(name, version).ok_or_else(|| {
        fail(MessageError::UnknownMessage {
            position,
            name: name.clone(),
            version: version.as_u32(),
        })
    })?;

    let msg = (spec.parse)(payload.clone()).map_err(|e| invalid(e.to_string()))?;
    msg.validate().map_err(invalid)?;
    Ok(msg)
}

/// Encodes `messages` for a peer speaking `version`.
pub fn encode_messages(messages: &[Message], version: MessageVersion) -> String {
    let narrowed: Vec<Message> = messages
        .iter()
        .cloned()
        .map(|m| m.downgrade(version))
        .collect();

    match serde_json::to_string(&narrowed) {
        Ok(text) => text,
        Err(e) => {
            // Only reachable through a Serialize bug; logged, never sent on the wire.
            tracing::error!("failed to encode {} message(s): {e}", narrowed.len());
            "[]".to_string()
        }
    }
}

/// Encodes a single message as a one-element batch.
pub fn encode_message(message: &Message, version: MessageVersion) -> String {
    encode_messages(std::slice::from_ref(message), version)
}
