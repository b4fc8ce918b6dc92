//! Message codec.
//!
//! Inbound text is parsed once and classified by the members it carries;
//! outbound messages are serialized to compact JSON. Line transports frame
//! each message with CRLF.

use serde_json::Value;
use thiserror::Error;

use crate::messages::{InboundMessage, ServerMessage};
use signalk_hub_core::{CONTEXT, VESSELS};

/// Line terminator used by line-oriented transports.
pub const LINE_END: &str = "\r\n";

/// Errors that can occur during message encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON (de)serialization failed.
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Received binary frame instead of text.
    #[error("Expected text frame, received binary")]
    BinaryFrame,

    /// The message is JSON but not an object.
    #[error("Message is not a JSON object")]
    NotAnObject,

    /// Message type could not be determined.
    #[error("Unknown message type")]
    UnknownMessage,
}

/// Encode a server message to a JSON string.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, CodecError> {
    serde_json::to_string(msg).map_err(CodecError::from)
}

/// Decode and classify one inbound message.
pub fn decode_inbound(text: &str) -> Result<InboundMessage, CodecError> {
    let value: Value = serde_json::from_str(text.trim())?;
    classify(value)
}

/// Classify a parsed message.
///
/// Whole documents win over everything else; requests are recognised by
/// their verb member; anything else with a `context` is a delta.
pub fn classify(value: Value) -> Result<InboundMessage, CodecError> {
    let Some(map) = value.as_object() else {
        return Err(CodecError::NotAnObject);
    };

    if map.contains_key(VESSELS) {
        return Ok(InboundMessage::Document(value));
    }
    if map.contains_key("subscribe") {
        return Ok(InboundMessage::Subscribe(serde_json::from_value(value)?));
    }
    if map.contains_key("unsubscribe") {
        return Ok(InboundMessage::Unsubscribe(serde_json::from_value(value)?));
    }
    if map.contains_key("get") {
        return Ok(InboundMessage::Get(serde_json::from_value(value)?));
    }
    if map.contains_key("list") {
        return Ok(InboundMessage::List(serde_json::from_value(value)?));
    }
    if map.contains_key(CONTEXT) {
        return Ok(InboundMessage::Delta(value));
    }
    Err(CodecError::UnknownMessage)
}

/// Append the line terminator to an encoded payload.
pub fn frame_line(payload: &str) -> String {
    let mut line = String::with_capacity(payload.len() + LINE_END.len());
    line.push_str(payload);
    line.push_str(LINE_END);
    line
}
