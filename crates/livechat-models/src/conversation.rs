use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Assigned,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Assigned => "assigned",
            Self::Closed => "closed",
        }
    }

    /// Lifecycle edges: open -> assigned -> closed, or open -> closed.
    pub fn can_transition_to(self, next: ConversationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Open, Self::Assigned) | (Self::Open, Self::Closed) | (Self::Assigned, Self::Closed)
        )
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "assigned" => Ok(Self::Assigned),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown conversation status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: i64,
    pub candidate_id: i64,
    pub supervisor_id: i64,
    pub agent_id: Option<i64>,
    pub status: ConversationStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_candidate(&self, user_id: i64) -> bool {
        self.candidate_id == user_id
    }

    pub fn is_assigned_agent(&self, user_id: i64) -> bool {
        self.agent_id == Some(user_id)
    }

    pub fn is_supervisor(&self, user_id: i64) -> bool {
        self.supervisor_id == user_id
    }

    pub fn is_participant(&self, user_id: i64) -> bool {
        self.is_candidate(user_id) || self.is_assigned_agent(user_id) || self.is_supervisor(user_id)
    }
}
