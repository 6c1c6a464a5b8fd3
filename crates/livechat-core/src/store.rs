use async_trait::async_trait;
use chrono::{DateTime, Utc};
use livechat_db::{DbError, DbPool};
use livechat_models::conversation::{Conversation, ConversationStatus};
use livechat_models::message::ChatMessage;

/// Durable conversation records as seen by the live session layer.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Conversation>, DbError>;

    /// `open -> assigned` on behalf of `agent_id`. `Ok(false)` when the
    /// conversation is no longer open or no longer assigned to that agent.
    async fn mark_assigned(&self, id: i64, agent_id: i64) -> Result<bool, DbError>;

    /// Move `id` from `expected` to `next`. `Ok(false)` means the stored
    /// status had already moved on and nothing was written.
    async fn update_status(
        &self,
        id: i64,
        expected: ConversationStatus,
        next: ConversationStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError>;
}

/// Permanent transcript storage.
#[async_trait]
pub trait MessageLog: Send + Sync {
    /// All-or-nothing append preserving slice order.
    async fn append_batch(&self, conversation_id: i64, messages: &[ChatMessage])
        -> Result<u64, DbError>;

    async fn list_for_conversation(&self, conversation_id: i64) -> Result<Vec<ChatMessage>, DbError>;
}

/// Both collaborators backed by the shared sqlx pool.
#[derive(Clone)]
pub struct SqlStore {
    pool: DbPool,
}

impl SqlStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConversationStore for SqlStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Conversation>, DbError> {
        livechat_db::conversations::get_conversation(&self.pool, id).await
    }

    async fn mark_assigned(&self, id: i64, agent_id: i64) -> Result<bool, DbError> {
        livechat_db::conversations::mark_assigned(&self.pool, id, agent_id).await
    }

    async fn update_status(
        &self,
        id: i64,
        expected: ConversationStatus,
        next: ConversationStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        livechat_db::conversations::transition_status(&self.pool, id, expected, next, closed_at)
            .await
    }
}

#[async_trait]
impl MessageLog for SqlStore {
    async fn append_batch(
        &self,
        conversation_id: i64,
        messages: &[ChatMessage],
    ) -> Result<u64, DbError> {
        livechat_db::messages::append_batch(&self.pool, conversation_id, messages).await
    }

    async fn list_for_conversation(&self, conversation_id: i64) -> Result<Vec<ChatMessage>, DbError> {
        let rows = livechat_db::messages::list_for_conversation(&self.pool, conversation_id).await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
