//! Structural schema check run over a whole batch before any element is
//! decoded.
//!
//! The check covers the envelope (top-level array, single-key element objects,
//! object payloads, an unsigned `Id`) and, for message names known at the
//! decoder's version, the presence and JSON shape of each declared field.
//! Unknown names pass this stage; they are reported per element by the codec.

use serde_json::{Map, Value};

use super::messages::MessageVersion;
use super::table;
use crate::error::MessageError;

/// Validates `batch` against the schema for `version`.
///
/// On success returns the array elements, each known to be a single-key
/// object whose payload is an object with a `u32` `Id`.
///
/// # Errors
///
/// Returns [`MessageError::Schema`] describing the first violation found.
pub fn validate_batch(batch: &Value, version: MessageVersion) -> Result<&[Value], MessageError> {
    let elements = batch
        .as_array()
        .ok_or_else(|| schema_error(format!("top level must be an array, got {}", kind_of(batch))))?;

    if elements.is_empty() {
        return Err(schema_error("message array must not be empty".to_string()));
    }

    for (position, element) in elements.iter().enumerate() {
        validate_element(position, element, version)?;
    }

    Ok(elements.as_slice())
}

fn validate_element(
    position: usize,
    element: &Value,
    version: MessageVersion,
) -> Result<(), MessageError> {
    let object = element.as_object().ok_or_else(|| {
        schema_error(format!(
            "element {position} must be an object, got {}",
            kind_of(element)
        ))
    })?;

    let (name, payload) = match object.len() {
        1 => object
            .iter()
            .next()
            .ok_or_else(|| schema_error(format!("element {position} has no message name")))?,
        0 => return Err(schema_error(format!("element {position} has no message name"))),
        n => {
            return Err(schema_error(format!(
                "element {position} must have exactly one key, found {n}"
            )))
        }
    };

    let fields = payload.as_object().ok_or_else(|| {
        schema_error(format!(
            "element {position} ({name}): payload must be an object, got {}",
            kind_of(payload)
        ))
    })?;

    match fields.get("Id") {
        Some(id) if id.as_u64().is_some_and(|v| v <= u64::from(u32::MAX)) => {}
        Some(id) => {
            return Err(schema_error(format!(
                "element {position} ({name}): Id must be an unsigned 32-bit integer, got {id}"
            )))
        }
        None => {
            return Err(schema_error(format!(
                "element {position} ({name}): missing required field Id"
            )))
        }
    }

    if let Some(spec) = table::lookup(name, version) {
        validate_fields(position, name, fields, spec.fields)?;
    }

    Ok(())
}

fn validate_fields(
    position: usize,
    name: &str,
    fields: &Map<String, Value>,
    rules: &[table::FieldRule],
) -> Result<(), MessageError> {
    for rule in rules {
        match fields.get(rule.name) {
            None if rule.required => {
                return Err(schema_error(format!(
                    "element {position} ({name}): missing required field {}",
                    rule.name
                )));
            }
            None => {}
            Some(value) if !rule.kind.matches(value) => {
                return Err(schema_error(format!(
                    "element {position} ({name}): field {} must be {}, got {value}",
                    rule.name,
                    rule.kind.describe()
                )));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

fn schema_error(reason: String) -> MessageError {
    MessageError::Schema(reason)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
