use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use livechat_core::AppState;
use livechat_models::conversation::{Conversation, ConversationStatus};
use livechat_models::message::{format_timestamp, ChatMessage};
use livechat_models::role::Role;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::middleware::AuthUser;
use crate::routes::{parse_id_value, success};

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(rename = "supervisorId")]
    pub supervisor_id: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct AssignAgentRequest {
    #[serde(rename = "agentId")]
    pub agent_id: Option<Value>,
}

fn parse_conversation_id(raw: &str) -> Result<i64, ApiError> {
    livechat_util::snowflake::parse(raw)
        .ok_or_else(|| ApiError::bad_request(format!("Invalid conversation id: {raw}")))
}

async fn load_conversation(state: &AppState, id: i64) -> Result<Conversation, ApiError> {
    livechat_db::conversations::get_conversation(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found("Conversation not found"))
}

fn conversation_to_json(conversation: &Conversation) -> Value {
    json!({
        "id": conversation.id.to_string(),
        "status": conversation.status,
        "candidateId": conversation.candidate_id.to_string(),
        "supervisorId": conversation.supervisor_id.to_string(),
        "agentId": conversation.agent_id.map(|id| id.to_string()),
        "closedAt": conversation.closed_at.map(format_timestamp),
        "createdAt": format_timestamp(conversation.created_at),
        "updatedAt": format_timestamp(conversation.updated_at),
    })
}

fn message_to_json(message: &ChatMessage) -> Value {
    json!({
        "senderId": message.sender_id.to_string(),
        "senderRole": message.sender_role,
        "content": message.content,
        "createdAt": format_timestamp(message.created_at),
    })
}

pub async fn create_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateConversationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    auth.require_role(&[Role::Candidate])?;

    let supervisor_id = parse_id_value(body.supervisor_id.as_ref())
        .ok_or_else(|| ApiError::bad_request("supervisorId is required"))?;

    let supervisor = livechat_db::users::get_user_by_id(&state.db, supervisor_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Supervisor not found"))?;
    if supervisor.role != Role::Supervisor {
        return Err(ApiError::bad_request(
            "supervisorId must reference a user with supervisor role",
        ));
    }

    let active_conflict = || ApiError::Conflict("You already have an active conversation".into());
    if livechat_db::conversations::find_active_for_candidate(&state.db, auth.user_id)
        .await?
        .is_some()
    {
        return Err(active_conflict());
    }

    let id = livechat_util::snowflake::generate(state.config.worker_id);
    let conversation = livechat_db::conversations::create_conversation(
        &state.db,
        id,
        auth.user_id,
        supervisor_id,
    )
    .await
    .map_err(|e| {
        if e.is_unique_violation() {
            active_conflict()
        } else {
            ApiError::from(e)
        }
    })?;

    tracing::info!(
        conversation_id = conversation.id,
        candidate_id = auth.user_id,
        supervisor_id,
        "conversation created"
    );

    Ok((
        StatusCode::CREATED,
        Json(success(json!({
            "id": conversation.id.to_string(),
            "status": conversation.status,
            "supervisorId": conversation.supervisor_id.to_string(),
        }))),
    ))
}

pub async fn assign_agent(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
    Json(body): Json<AssignAgentRequest>,
) -> Result<Json<Value>, ApiError> {
    auth.require_role(&[Role::Supervisor])?;

    let agent_id = parse_id_value(body.agent_id.as_ref())
        .ok_or_else(|| ApiError::bad_request("agentId is required"))?;
    let conversation_id = parse_conversation_id(&conversation_id)?;

    let conversation = load_conversation(&state, conversation_id).await?;
    if !conversation.is_supervisor(auth.user_id) {
        return Err(ApiError::forbidden("cannot assign agent"));
    }

    let agent = livechat_db::users::get_user_by_id(&state.db, agent_id)
        .await?
        .ok_or_else(|| ApiError::not_found("Agent not found"))?;
    if agent.role != Role::Agent {
        return Err(ApiError::bad_request(
            "agentId must reference a user with agent role",
        ));
    }
    if agent.supervisor_id != Some(auth.user_id) {
        return Err(ApiError::forbidden("Agent doesn't belong to you"));
    }

    match conversation.status {
        ConversationStatus::Closed => {
            return Err(ApiError::bad_request(
                "Cannot assign agent to closed conversation",
            ));
        }
        ConversationStatus::Assigned => {
            return Err(ApiError::Conflict(
                "Cannot reassign a conversation the agent has already joined".into(),
            ));
        }
        ConversationStatus::Open => {}
    }

    let updated = livechat_db::conversations::assign_agent(&state.db, conversation_id, agent_id)
        .await
        .map_err(|e| match e {
            // Status moved on between the read and the write.
            livechat_db::DbError::NotFound => {
                ApiError::Conflict("Conversation is no longer open".into())
            }
            other => ApiError::from(other),
        })?;

    tracing::info!(
        conversation_id,
        agent_id,
        supervisor_id = auth.user_id,
        "agent assigned"
    );

    Ok(Json(success(json!({
        "conversationId": updated.id.to_string(),
        "agentId": agent_id.to_string(),
        "supervisorId": updated.supervisor_id.to_string(),
    }))))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    let conversation = load_conversation(&state, conversation_id).await?;

    if !auth.is_admin() && !conversation.is_participant(auth.user_id) {
        return Err(ApiError::forbidden("Not allowed to access this conversation"));
    }

    let messages = state.conversations.transcript_for(&conversation).await?;
    let mut data = conversation_to_json(&conversation);
    data["messages"] = Value::Array(messages.iter().map(message_to_json).collect());
    Ok(Json(success(data)))
}

pub async fn close_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    auth.require_role(&[Role::Admin, Role::Supervisor])?;
    let conversation_id = parse_conversation_id(&conversation_id)?;

    let conversation = load_conversation(&state, conversation_id).await?;
    if auth.role == Role::Supervisor && !conversation.is_supervisor(auth.user_id) {
        return Err(ApiError::forbidden("Not allowed to close this conversation"));
    }

    let closed = state.conversations.close_unassigned(conversation_id).await?;
    tracing::info!(
        conversation_id,
        closed_by = auth.user_id,
        role = %auth.role,
        "conversation closed over http"
    );

    Ok(Json(success(json!({
        "conversationId": closed.id.to_string(),
        "status": closed.status,
    }))))
}
