use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::ConversationStatus;
use crate::message::{format_timestamp, ChatMessage};
use crate::role::Role;

// Client -> Server events
pub const EVENT_JOIN_CONVERSATION: &str = "JOIN_CONVERSATION";
pub const EVENT_SEND_MESSAGE: &str = "SEND_MESSAGE";
pub const EVENT_LEAVE_CONVERSATION: &str = "LEAVE_CONVERSATION";
pub const EVENT_CLOSE_CONVERSATION: &str = "CLOSE_CONVERSATION";

// Server -> Client events
pub const EVENT_JOINED_CONVERSATION: &str = "JOINED_CONVERSATION";
pub const EVENT_NEW_MESSAGE: &str = "NEW_MESSAGE";
pub const EVENT_LEFT_CONVERSATION: &str = "LEFT_CONVERSATION";
pub const EVENT_CONVERSATION_CLOSED: &str = "CONVERSATION_CLOSED";
pub const EVENT_ERROR: &str = "ERROR";

/// Inbound frame shape. Both fields stay loosely typed so malformed frames
/// can be told apart from unknown events.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub event: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEvent {
    JoinConversation,
    SendMessage,
    LeaveConversation,
    CloseConversation,
}

impl ClientEvent {
    pub const ALL: [ClientEvent; 4] = [
        ClientEvent::JoinConversation,
        ClientEvent::SendMessage,
        ClientEvent::LeaveConversation,
        ClientEvent::CloseConversation,
    ];

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            EVENT_JOIN_CONVERSATION => Some(Self::JoinConversation),
            EVENT_SEND_MESSAGE => Some(Self::SendMessage),
            EVENT_LEAVE_CONVERSATION => Some(Self::LeaveConversation),
            EVENT_CLOSE_CONVERSATION => Some(Self::CloseConversation),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::JoinConversation => EVENT_JOIN_CONVERSATION,
            Self::SendMessage => EVENT_SEND_MESSAGE,
            Self::LeaveConversation => EVENT_LEAVE_CONVERSATION,
            Self::CloseConversation => EVENT_CLOSE_CONVERSATION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMessagePayload {
    #[serde(rename = "conversationId")]
    pub conversation_id: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "senderRole")]
    pub sender_role: Role,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl NewMessagePayload {
    pub fn new(conversation_id: i64, message: &ChatMessage) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            sender_id: message.sender_id.to_string(),
            sender_role: message.sender_role,
            content: message.content.clone(),
            created_at: format_timestamp(message.created_at),
        }
    }
}

/// Server -> client frame, serialized as `{"event": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundEvent {
    JoinedConversation {
        #[serde(rename = "conversationId")]
        conversation_id: String,
        status: ConversationStatus,
    },
    NewMessage(NewMessagePayload),
    LeftConversation {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    ConversationClosed {
        #[serde(rename = "conversationId")]
        conversation_id: String,
    },
    Error {
        message: String,
    },
}

impl OutboundEvent {
    pub fn joined(conversation_id: i64, status: ConversationStatus) -> Self {
        Self::JoinedConversation {
            conversation_id: conversation_id.to_string(),
            status,
        }
    }

    pub fn left(conversation_id: i64) -> Self {
        Self::LeftConversation {
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn closed(conversation_id: i64) -> Self {
        Self::ConversationClosed {
            conversation_id: conversation_id.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinedConversation { .. } => EVENT_JOINED_CONVERSATION,
            Self::NewMessage(_) => EVENT_NEW_MESSAGE,
            Self::LeftConversation { .. } => EVENT_LEFT_CONVERSATION,
            Self::ConversationClosed { .. } => EVENT_CONVERSATION_CLOSED,
            Self::Error { .. } => EVENT_ERROR,
        }
    }
}
