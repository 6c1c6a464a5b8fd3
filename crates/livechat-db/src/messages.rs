use crate::{datetime_from_db_text, datetime_to_db_text, decode_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use livechat_models::message::ChatMessage;
use livechat_models::role::Role;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub conversation_id: i64,
    pub position: i64,
    pub sender_id: i64,
    pub sender_role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for MessageRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let sender_role_raw: String = row.try_get("sender_role")?;
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            conversation_id: row.try_get("conversation_id")?,
            position: row.try_get("position")?,
            sender_id: row.try_get("sender_id")?,
            sender_role: decode_text(&sender_role_raw, "sender_role")?,
            content: row.try_get("content")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

impl From<MessageRow> for ChatMessage {
    fn from(row: MessageRow) -> Self {
        ChatMessage {
            sender_id: row.sender_id,
            sender_role: row.sender_role,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

/// Append an ordered batch to a conversation's log inside one transaction.
/// Positions continue after the highest stored one, so a batch is either
/// fully visible in submission order or not at all. Returns rows inserted.
pub async fn append_batch(
    pool: &DbPool,
    conversation_id: i64,
    messages: &[ChatMessage],
) -> Result<u64, DbError> {
    if messages.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;

    let last_position: i64 = sqlx::query_scalar(
        "SELECT COALESCE(MAX(position), -1) FROM messages WHERE conversation_id = $1",
    )
    .bind(conversation_id)
    .fetch_one(&mut *tx)
    .await?;

    let mut inserted = 0u64;
    for (offset, message) in messages.iter().enumerate() {
        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, position, sender_id, sender_role, content, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(conversation_id)
        .bind(last_position + 1 + offset as i64)
        .bind(message.sender_id)
        .bind(message.sender_role.as_str())
        .bind(message.content.as_str())
        .bind(datetime_to_db_text(message.created_at))
        .execute(&mut *tx)
        .await?;
        inserted += result.rows_affected();
    }

    tx.commit().await?;
    Ok(inserted)
}

/// The persisted transcript, oldest first.
pub async fn list_for_conversation(
    pool: &DbPool,
    conversation_id: i64,
) -> Result<Vec<MessageRow>, DbError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT conversation_id, position, sender_id, sender_role, content, created_at
         FROM messages WHERE conversation_id = $1 ORDER BY position ASC",
    )
    .bind(conversation_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn count_for_conversation(pool: &DbPool, conversation_id: i64) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = $1")
        .bind(conversation_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
