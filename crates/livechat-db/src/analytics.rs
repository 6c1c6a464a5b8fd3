use crate::{DbError, DbPool};
use sqlx::Row;

/// Per-supervisor team size and closed-conversation throughput.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStats {
    pub supervisor_id: i64,
    pub supervisor_name: String,
    pub agents: i64,
    pub conversations_handled: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for SupervisorStats {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            supervisor_id: row.try_get("supervisor_id")?,
            supervisor_name: row.try_get("supervisor_name")?,
            agents: row.try_get("agents")?,
            conversations_handled: row.try_get("conversations_handled")?,
        })
    }
}

pub async fn supervisor_stats(pool: &DbPool) -> Result<Vec<SupervisorStats>, DbError> {
    let rows = sqlx::query_as::<_, SupervisorStats>(
        "SELECT s.id AS supervisor_id,
                s.name AS supervisor_name,
                (SELECT COUNT(*) FROM users a
                  WHERE a.role = 'agent' AND a.supervisor_id = s.id) AS agents,
                (SELECT COUNT(*) FROM conversations c
                   JOIN users a ON a.id = c.agent_id
                  WHERE a.role = 'agent' AND a.supervisor_id = s.id
                    AND c.status = 'closed') AS conversations_handled
         FROM users s
         WHERE s.role = 'supervisor'
         ORDER BY s.id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
