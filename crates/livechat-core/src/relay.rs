use livechat_models::gateway::OutboundEvent;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId, Frame};

fn encode(event: &OutboundEvent) -> Option<Frame> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            tracing::error!(event = event.event_name(), error = %e, "failed to encode outbound event");
            None
        }
    }
}

/// Queue one event for one connection. Closed or saturated queues drop it.
pub fn send(conn: &Connection, event: &OutboundEvent) -> bool {
    let Some(frame) = encode(event) else {
        return false;
    };
    deliver(conn, frame, event.event_name())
}

/// Fan an event out to `members`, skipping `excluding`. Returns how many
/// recipients accepted the frame.
pub fn broadcast(
    members: &[Arc<Connection>],
    event: &OutboundEvent,
    excluding: Option<ConnectionId>,
) -> usize {
    let Some(frame) = encode(event) else {
        return 0;
    };
    members
        .iter()
        .filter(|member| Some(member.id()) != excluding)
        .filter(|member| deliver(member, Arc::clone(&frame), event.event_name()))
        .count()
}

fn deliver(conn: &Connection, frame: Frame, event: &'static str) -> bool {
    if conn.deliver(frame) {
        return true;
    }
    if conn.is_open() {
        tracing::warn!(
            connection_id = %conn.id(),
            user_id = conn.user_id(),
            event,
            dropped = conn.dropped_count(),
            "outbound queue full, dropping event"
        );
    } else {
        tracing::debug!(connection_id = %conn.id(), event, "recipient gone, dropping event");
    }
    false
}
