use crate::{datetime_from_db_text, datetime_to_db_text, decode_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use livechat_models::conversation::{Conversation, ConversationStatus};
use sqlx::Row;

const CONVERSATION_COLUMNS: &str =
    "id, candidate_id, supervisor_id, agent_id, status, closed_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct ConversationRow {
    pub id: i64,
    pub candidate_id: i64,
    pub supervisor_id: i64,
    pub agent_id: Option<i64>,
    pub status: ConversationStatus,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for ConversationRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let status_raw: String = row.try_get("status")?;
        let closed_at_raw: Option<String> = row.try_get("closed_at")?;
        let created_at_raw: String = row.try_get("created_at")?;
        let updated_at_raw: String = row.try_get("updated_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            candidate_id: row.try_get("candidate_id")?,
            supervisor_id: row.try_get("supervisor_id")?,
            agent_id: row.try_get("agent_id")?,
            status: decode_text(&status_raw, "status")?,
            closed_at: closed_at_raw
                .as_deref()
                .map(datetime_from_db_text)
                .transpose()?,
            created_at: datetime_from_db_text(&created_at_raw)?,
            updated_at: datetime_from_db_text(&updated_at_raw)?,
        })
    }
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            candidate_id: row.candidate_id,
            supervisor_id: row.supervisor_id,
            agent_id: row.agent_id,
            status: row.status,
            closed_at: row.closed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

pub async fn create_conversation(
    pool: &DbPool,
    id: i64,
    candidate_id: i64,
    supervisor_id: i64,
) -> Result<Conversation, DbError> {
    let now = datetime_to_db_text(Utc::now());
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "INSERT INTO conversations (id, candidate_id, supervisor_id, status, created_at, updated_at)
         VALUES ($1, $2, $3, 'open', $4, $4)
         RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(id)
    .bind(candidate_id)
    .bind(supervisor_id)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(row.into())
}

pub async fn get_conversation(pool: &DbPool, id: i64) -> Result<Option<Conversation>, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Into::into))
}

/// The candidate's open or assigned conversation, if any.
pub async fn find_active_for_candidate(
    pool: &DbPool,
    candidate_id: i64,
) -> Result<Option<Conversation>, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "SELECT {CONVERSATION_COLUMNS} FROM conversations
         WHERE candidate_id = $1 AND status IN ('open', 'assigned')
         ORDER BY created_at DESC
         LIMIT 1"
    ))
    .bind(candidate_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Into::into))
}

/// Record the assignee. Only `open` conversations accept one; anything else
/// is left untouched and yields `DbError::NotFound`.
pub async fn assign_agent(
    pool: &DbPool,
    id: i64,
    agent_id: i64,
) -> Result<Conversation, DbError> {
    let row = sqlx::query_as::<_, ConversationRow>(&format!(
        "UPDATE conversations SET agent_id = $2, updated_at = $3
         WHERE id = $1 AND status = 'open'
         RETURNING {CONVERSATION_COLUMNS}"
    ))
    .bind(id)
    .bind(agent_id)
    .bind(datetime_to_db_text(Utc::now()))
    .fetch_optional(pool)
    .await?;
    row.map(Into::into).ok_or(DbError::NotFound)
}

/// The assigned agent's first live join: `open -> assigned`, but only while
/// `agent_id` is still the stored assignee. Returns `false` when the status
/// moved on or the conversation was handed to someone else.
pub async fn mark_assigned(pool: &DbPool, id: i64, agent_id: i64) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE conversations
         SET status = 'assigned', updated_at = $3
         WHERE id = $1 AND status = 'open' AND agent_id = $2",
    )
    .bind(id)
    .bind(agent_id)
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Compare-and-set status transition. Returns `false` when the stored status
/// was no longer `expected`, leaving the row unchanged. `closed_at` is only
/// written when provided.
pub async fn transition_status(
    pool: &DbPool,
    id: i64,
    expected: ConversationStatus,
    next: ConversationStatus,
    closed_at: Option<DateTime<Utc>>,
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE conversations
         SET status = $3, closed_at = COALESCE($4, closed_at), updated_at = $5
         WHERE id = $1 AND status = $2",
    )
    .bind(id)
    .bind(expected.as_str())
    .bind(next.as_str())
    .bind(closed_at.map(datetime_to_db_text))
    .bind(datetime_to_db_text(Utc::now()))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}
