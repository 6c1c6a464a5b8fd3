use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use livechat_core::auth::{self, AuthError, Identity};
use livechat_core::connection::Connection;
use livechat_core::error::CoreError;
use livechat_core::{relay, AppState};
use livechat_models::gateway::{ClientEvent, OutboundEvent};
use std::sync::Arc;

use crate::protocol::{self, Command};

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const UNAUTHORIZED: &str = "Unauthorized or invalid token";

pub async fn handle_connection(socket: WebSocket, state: AppState, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    let identity = match authenticate(token.as_deref(), &state.config.jwt_secret) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::debug!(error = %e, "gateway: rejected connection");
            reject(&mut sender).await;
            return;
        }
    };

    let (conn, mut outbound) =
        Connection::channel(identity, state.config.outbound_queue_capacity);
    tracing::info!(
        user_id = identity.user_id,
        role = %identity.role,
        connection_id = %conn.id(),
        "gateway: connected"
    );

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let reason = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => match protocol::parse_frame(text.as_str()) {
                Ok(command) => dispatch(&state, &conn, command).await,
                Err(message) => {
                    relay::send(&conn, &OutboundEvent::error(message));
                }
            },
            Some(Ok(Message::Binary(_))) => {
                relay::send(&conn, &OutboundEvent::error(protocol::INVALID_SCHEMA));
            }
            Some(Ok(Message::Close(_))) | None => break "closed by client".to_string(),
            Some(Ok(_)) => {}
            Some(Err(e)) => break format!("receive error: {e}"),
        }
    };

    state.conversations.disconnect(&conn);
    writer.abort();
    tracing::info!(
        user_id = identity.user_id,
        connection_id = %conn.id(),
        dropped = conn.dropped_count(),
        reason = %reason,
        "gateway: disconnected"
    );
}

fn authenticate(token: Option<&str>, secret: &str) -> Result<Identity, AuthError> {
    auth::authenticate(token.ok_or(AuthError::InvalidToken)?, secret)
}

async fn reject(sender: &mut (impl SinkExt<Message> + Unpin)) {
    if let Ok(payload) = serde_json::to_string(&OutboundEvent::error(UNAUTHORIZED)) {
        let _ = sender.send(Message::Text(payload.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: UNAUTHORIZED.to_string().into(),
        })))
        .await;
}

async fn dispatch(state: &AppState, conn: &Arc<Connection>, command: Command) {
    let event = command.event();
    let conversation_id = command.conversation_id();
    let conversations = &state.conversations;

    let result = match command {
        Command::Join { conversation_id } => {
            conversations.join(conn, conversation_id).await.map(|_| ())
        }
        Command::SendMessage {
            conversation_id,
            content,
        } => conversations
            .send_message(conn, conversation_id, &content)
            .await
            .map(|_| ()),
        Command::Leave { conversation_id } => conversations.leave(conn, conversation_id).await,
        Command::Close { conversation_id } => conversations.close(conn, conversation_id).await,
    };

    if let Err(err) = result {
        if matches!(err, CoreError::Storage(_)) {
            tracing::error!(
                event = event.as_str(),
                conversation_id,
                user_id = conn.user_id(),
                error = %err,
                "gateway: event failed"
            );
        } else {
            tracing::debug!(
                event = event.as_str(),
                conversation_id,
                user_id = conn.user_id(),
                error = %err,
                "gateway: event rejected"
            );
        }
        relay::send(conn, &OutboundEvent::error(client_message(event, &err)));
    }
}

/// Storage details stay in the logs; the client gets a generic failure.
fn client_message(event: ClientEvent, err: &CoreError) -> String {
    match err {
        CoreError::Storage(_) => match event {
            ClientEvent::JoinConversation => "Failed to join conversation",
            ClientEvent::SendMessage => "Failed to send message",
            ClientEvent::LeaveConversation => "Failed to leave conversation",
            ClientEvent::CloseConversation => "Failed to close conversation",
        }
        .to_string(),
        other => other.to_string(),
    }
}
