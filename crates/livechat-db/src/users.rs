use crate::{datetime_from_db_text, datetime_to_db_text, decode_text, DbError, DbPool};
use chrono::{DateTime, Utc};
use livechat_models::role::Role;
use sqlx::Row;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub supervisor_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::any::AnyRow> for UserRow {
    fn from_row(row: &'r sqlx::any::AnyRow) -> Result<Self, sqlx::Error> {
        let role_raw: String = row.try_get("role")?;
        let created_at_raw: String = row.try_get("created_at")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            email: row.try_get("email")?,
            role: decode_text(&role_raw, "role")?,
            supervisor_id: row.try_get("supervisor_id")?,
            created_at: datetime_from_db_text(&created_at_raw)?,
        })
    }
}

/// Accounts are provisioned by the identity service; this is used by seeding
/// tooling and tests.
pub async fn create_user(
    pool: &DbPool,
    id: i64,
    name: &str,
    email: &str,
    role: Role,
    supervisor_id: Option<i64>,
) -> Result<UserRow, DbError> {
    let row = sqlx::query_as::<_, UserRow>(
        "INSERT INTO users (id, name, email, role, supervisor_id, created_at)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING id, name, email, role, supervisor_id, created_at",
    )
    .bind(id)
    .bind(name)
    .bind(email)
    .bind(role.as_str())
    .bind(supervisor_id)
    .bind(datetime_to_db_text(Utc::now()))
    .fetch_one(pool)
    .await?;
    Ok(row)
}

pub async fn get_user_by_id(pool: &DbPool, id: i64) -> Result<Option<UserRow>, DbError> {
    let row = sqlx::query_as::<_, UserRow>(
        "SELECT id, name, email, role, supervisor_id, created_at FROM users WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}
