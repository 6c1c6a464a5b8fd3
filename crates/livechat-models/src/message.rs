use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::role::Role;

/// A chat line exchanged in a live room, held in memory until the
/// conversation closes and then copied verbatim into the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: i64,
    pub sender_role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Stamped with millisecond precision so the persisted copy compares equal.
    pub fn new(sender_id: i64, sender_role: Role, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            sender_role,
            content: content.into(),
            created_at: Utc::now().trunc_subsecs(3),
        }
    }
}

/// Wire rendering of timestamps: RFC 3339 with millisecond precision.
pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
