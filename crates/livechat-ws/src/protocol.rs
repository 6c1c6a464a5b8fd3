//! Inbound frame parsing. Every rejection carries the message sent back to
//! the client in an `ERROR` event.

use livechat_models::gateway::{ClientEvent, Envelope};
use serde_json::Value;

pub const INVALID_SCHEMA: &str = "Invalid request schema";
pub const INVALID_FORMAT: &str = "Invalid message format";
pub const UNKNOWN_EVENT: &str = "Unknown event";
pub const CONVERSATION_ID_REQUIRED: &str = "conversationId is required";
pub const CONTENT_REQUIRED: &str = "content is required";
pub const CONVERSATION_NOT_FOUND: &str = "Conversation not found";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { conversation_id: i64 },
    SendMessage { conversation_id: i64, content: String },
    Leave { conversation_id: i64 },
    Close { conversation_id: i64 },
}

impl Command {
    pub fn event(&self) -> ClientEvent {
        match self {
            Self::Join { .. } => ClientEvent::JoinConversation,
            Self::SendMessage { .. } => ClientEvent::SendMessage,
            Self::Leave { .. } => ClientEvent::LeaveConversation,
            Self::Close { .. } => ClientEvent::CloseConversation,
        }
    }

    pub fn conversation_id(&self) -> i64 {
        match self {
            Self::Join { conversation_id }
            | Self::SendMessage {
                conversation_id, ..
            }
            | Self::Leave { conversation_id }
            | Self::Close { conversation_id } => *conversation_id,
        }
    }
}

pub fn parse_frame(text: &str) -> Result<Command, &'static str> {
    let value: Value = serde_json::from_str(text).map_err(|_| INVALID_SCHEMA)?;
    if !value.is_object() {
        return Err(INVALID_FORMAT);
    }
    let envelope: Envelope = serde_json::from_value(value).map_err(|_| INVALID_SCHEMA)?;

    let name = envelope
        .event
        .as_ref()
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or(INVALID_FORMAT)?;
    let event = ClientEvent::from_name(name).ok_or(UNKNOWN_EVENT)?;

    let data = envelope.data.unwrap_or(Value::Null);
    let conversation_id = conversation_id(&data)?;

    Ok(match event {
        ClientEvent::JoinConversation => Command::Join { conversation_id },
        ClientEvent::SendMessage => {
            let content = data
                .get("content")
                .and_then(Value::as_str)
                .ok_or(CONTENT_REQUIRED)?;
            Command::SendMessage {
                conversation_id,
                content: content.to_string(),
            }
        }
        ClientEvent::LeaveConversation => Command::Leave { conversation_id },
        ClientEvent::CloseConversation => Command::Close { conversation_id },
    })
}

/// Ids travel as strings but plain JSON numbers are accepted too.
fn conversation_id(data: &Value) -> Result<i64, &'static str> {
    match data.get("conversationId") {
        Some(Value::String(raw)) if !raw.trim().is_empty() => {
            livechat_util::snowflake::parse(raw.trim()).ok_or(CONVERSATION_NOT_FOUND)
        }
        Some(Value::Number(raw)) => raw
            .as_i64()
            .filter(|id| *id > 0)
            .ok_or(CONVERSATION_ID_REQUIRED),
        _ => Err(CONVERSATION_ID_REQUIRED),
    }
}
