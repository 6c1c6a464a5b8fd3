use axum::{extract::State, Json};
use livechat_core::AppState;
use livechat_models::role::Role;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::routes::success;

pub async fn analytics(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Value>, ApiError> {
    auth.require_role(&[Role::Admin])?;

    let stats = livechat_db::analytics::supervisor_stats(&state.db).await?;
    let data: Vec<Value> = stats
        .into_iter()
        .map(|row| {
            json!({
                "supervisorId": row.supervisor_id.to_string(),
                "supervisorName": row.supervisor_name,
                "agents": row.agents,
                "conversationsHandled": row.conversations_handled,
            })
        })
        .collect();
    Ok(Json(success(Value::Array(data))))
}
