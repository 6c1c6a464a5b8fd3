use livechat_models::gateway::ClientEvent;
use livechat_models::role::Role;

use crate::error::CoreError;

/// Whether `role` may invoke `event` at all. Ownership (which candidate, which
/// agent) is checked separately against the conversation record.
pub fn is_allowed(event: ClientEvent, role: Role) -> bool {
    match event {
        ClientEvent::JoinConversation
        | ClientEvent::SendMessage
        | ClientEvent::LeaveConversation => role.is_live_participant(),
        ClientEvent::CloseConversation => role == Role::Agent,
    }
}

pub fn require_event_role(event: ClientEvent, role: Role) -> Result<(), CoreError> {
    if is_allowed(event, role) {
        Ok(())
    } else {
        Err(CoreError::forbidden("Forbidden for this role"))
    }
}
