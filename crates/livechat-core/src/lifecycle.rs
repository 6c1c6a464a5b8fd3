use chrono::{DateTime, Utc};
use dashmap::DashMap;
use livechat_models::conversation::{Conversation, ConversationStatus};
use livechat_models::gateway::{ClientEvent, NewMessagePayload, OutboundEvent};
use livechat_models::message::ChatMessage;
use livechat_models::role::Role;
use livechat_util::validation::{normalize_message_content, ValidationError};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use crate::buffer::MessageBuffer;
use crate::connection::Connection;
use crate::error::CoreError;
use crate::permissions::require_event_role;
use crate::relay;
use crate::rooms::{RoomKey, RoomRegistry};
use crate::store::{ConversationStore, MessageLog, SqlStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Phase {
    #[default]
    Live,
    /// A close is writing the transcript and status; joins and sends wait
    /// for the outcome by being rejected.
    Closing,
    Closed,
}

#[derive(Debug, Default)]
struct Section {
    phase: Phase,
    /// Buffered messages already in the log from a close whose status write
    /// failed. A retry only appends what follows.
    flushed: usize,
}

type SectionHandle = Arc<Mutex<Section>>;

/// Drives the live side of every conversation: rooms, buffered transcripts
/// and the `open -> assigned -> closed` lifecycle. All mutations of one
/// conversation are serialized through its section.
pub struct ConversationManager {
    conversations: Arc<dyn ConversationStore>,
    log: Arc<dyn MessageLog>,
    rooms: RoomRegistry,
    buffers: MessageBuffer,
    sections: DashMap<i64, SectionHandle>,
}

impl ConversationManager {
    pub fn new(conversations: Arc<dyn ConversationStore>, log: Arc<dyn MessageLog>) -> Self {
        Self {
            conversations,
            log,
            rooms: RoomRegistry::new(),
            buffers: MessageBuffer::new(),
            sections: DashMap::new(),
        }
    }

    pub fn with_sql_store(store: SqlStore) -> Self {
        let store = Arc::new(store);
        Self::new(store.clone(), store)
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn buffers(&self) -> &MessageBuffer {
        &self.buffers
    }

    pub async fn join(
        &self,
        conn: &Arc<Connection>,
        conversation_id: i64,
    ) -> Result<ConversationStatus, CoreError> {
        require_event_role(ClientEvent::JoinConversation, conn.identity().role)?;
        let handle = self.section(conversation_id);
        let result = self.join_locked(&handle, conn, conversation_id).await;
        self.release(conversation_id, handle);
        result
    }

    async fn join_locked(
        &self,
        handle: &SectionHandle,
        conn: &Arc<Connection>,
        conversation_id: i64,
    ) -> Result<ConversationStatus, CoreError> {
        let identity = conn.identity();
        let section = handle.lock().await;
        ensure_live(&section)?;

        let conversation = self.load(conversation_id).await?;
        if conversation.status == ConversationStatus::Closed {
            return Err(CoreError::already_closed());
        }

        let status = match identity.role {
            Role::Candidate => {
                if !conversation.is_candidate(identity.user_id) {
                    return Err(CoreError::forbidden("not allowed"));
                }
                conversation.status
            }
            Role::Agent => {
                if !conversation.is_assigned_agent(identity.user_id) {
                    return Err(CoreError::forbidden("not allowed"));
                }
                if conversation
                    .status
                    .can_transition_to(ConversationStatus::Assigned)
                {
                    let claimed = self
                        .conversations
                        .mark_assigned(conversation_id, identity.user_id)
                        .await?;
                    if !claimed {
                        return Err(CoreError::state_changed());
                    }
                    tracing::info!(
                        conversation_id,
                        agent_id = identity.user_id,
                        "conversation assigned"
                    );
                }
                ConversationStatus::Assigned
            }
            Role::Supervisor | Role::Admin => {
                return Err(CoreError::forbidden("Forbidden for this role"));
            }
        };

        self.rooms
            .join(RoomKey::for_conversation(conversation_id), conn);
        self.buffers.ensure(conversation_id);
        relay::send(conn, &OutboundEvent::joined(conversation_id, status));

        tracing::debug!(
            conversation_id,
            user_id = identity.user_id,
            role = %identity.role,
            connection_id = %conn.id(),
            status = %status,
            "joined conversation"
        );
        Ok(status)
    }

    /// Buffer a message and relay it to every other member of the room.
    pub async fn send_message(
        &self,
        conn: &Connection,
        conversation_id: i64,
        content: &str,
    ) -> Result<ChatMessage, CoreError> {
        let identity = conn.identity();
        require_event_role(ClientEvent::SendMessage, identity.role)?;
        let content = normalize_message_content(content).map_err(|e| match e {
            ValidationError::TooShort { .. } => CoreError::validation("content is required"),
            ValidationError::TooLong { max, .. } => {
                CoreError::validation(format!("content must be at most {max} characters"))
            }
        })?;

        let handle = self.section(conversation_id);
        let result = {
            let section = handle.lock().await;
            self.append_locked(&section, conn, conversation_id, content)
        };
        self.release(conversation_id, handle);
        result
    }

    fn append_locked(
        &self,
        section: &Section,
        conn: &Connection,
        conversation_id: i64,
        content: &str,
    ) -> Result<ChatMessage, CoreError> {
        ensure_live(section)?;
        let key = RoomKey::for_conversation(conversation_id);
        if !conn.is_in(key) {
            return Err(CoreError::conflict("You must join the conversation first"));
        }

        let identity = conn.identity();
        let message = ChatMessage::new(identity.user_id, identity.role, content);
        self.buffers.append(conversation_id, message.clone());

        let members = self.rooms.members_of(key);
        let event = OutboundEvent::NewMessage(NewMessagePayload::new(conversation_id, &message));
        let delivered = relay::broadcast(&members, &event, Some(conn.id()));
        tracing::debug!(
            conversation_id,
            user_id = identity.user_id,
            delivered,
            "message relayed"
        );
        Ok(message)
    }

    pub async fn leave(&self, conn: &Connection, conversation_id: i64) -> Result<(), CoreError> {
        require_event_role(ClientEvent::LeaveConversation, conn.identity().role)?;
        let key = RoomKey::for_conversation(conversation_id);
        let handle = self.section(conversation_id);
        let result = {
            let _section = handle.lock().await;
            if conn.is_in(key) {
                self.rooms.leave(key, conn);
                relay::send(conn, &OutboundEvent::left(conversation_id));
                tracing::debug!(
                    conversation_id,
                    user_id = conn.user_id(),
                    connection_id = %conn.id(),
                    "left conversation"
                );
                Ok(())
            } else {
                Err(CoreError::conflict("You are not in this conversation"))
            }
        };
        self.release(conversation_id, handle);
        result
    }

    /// Close an assigned conversation on behalf of its agent: flush the
    /// buffered transcript, persist the status, notify the room and tear it
    /// down. Storage failures leave the conversation assigned and intact.
    pub async fn close(&self, conn: &Connection, conversation_id: i64) -> Result<(), CoreError> {
        require_event_role(ClientEvent::CloseConversation, conn.identity().role)?;
        let handle = self.section(conversation_id);
        let result = self.close_assigned(&handle, conn, conversation_id).await;
        self.release(conversation_id, handle);
        result
    }

    async fn close_assigned(
        &self,
        handle: &SectionHandle,
        conn: &Connection,
        conversation_id: i64,
    ) -> Result<(), CoreError> {
        let agent_id = conn.user_id();

        let (pending, already_flushed) = {
            let mut section = handle.lock().await;
            let conversation = self.load(conversation_id).await?;
            if !conversation.is_assigned_agent(agent_id) {
                return Err(CoreError::forbidden("not allowed"));
            }
            ensure_live(&section)?;
            match conversation.status {
                ConversationStatus::Closed => return Err(CoreError::already_closed()),
                ConversationStatus::Open => {
                    return Err(CoreError::conflict("Conversation not yet assigned"));
                }
                ConversationStatus::Assigned => {}
            }
            self.begin_close(&mut section, conversation_id)
        };

        let _section = self
            .commit_close(
                handle,
                conversation_id,
                ConversationStatus::Assigned,
                &pending,
                already_flushed,
                Utc::now(),
            )
            .await?;

        let key = RoomKey::for_conversation(conversation_id);
        let event = OutboundEvent::closed(conversation_id);
        let members = self.rooms.members_of(key);
        relay::broadcast(&members, &event, Some(conn.id()));
        relay::send(conn, &event);
        self.rooms.delete_room(key);
        self.buffers.clear(conversation_id);

        tracing::info!(
            conversation_id,
            agent_id,
            persisted = already_flushed + pending.len(),
            "conversation closed"
        );
        Ok(())
    }

    /// Close a conversation that never got past `open`. Any room the
    /// candidate opened while waiting is notified and torn down.
    pub async fn close_unassigned(&self, conversation_id: i64) -> Result<Conversation, CoreError> {
        let handle = self.section(conversation_id);
        let result = self.close_unassigned_locked(&handle, conversation_id).await;
        self.release(conversation_id, handle);
        result
    }

    async fn close_unassigned_locked(
        &self,
        handle: &SectionHandle,
        conversation_id: i64,
    ) -> Result<Conversation, CoreError> {
        let (mut conversation, pending, already_flushed) = {
            let mut section = handle.lock().await;
            ensure_live(&section)?;

            let conversation = self.load(conversation_id).await?;
            if conversation.status != ConversationStatus::Open {
                return Err(CoreError::conflict(format!(
                    "Cannot close conversation with status: {}",
                    conversation.status
                )));
            }
            let (pending, already_flushed) = self.begin_close(&mut section, conversation_id);
            (conversation, pending, already_flushed)
        };

        let closed_at = Utc::now();
        let _section = self
            .commit_close(
                handle,
                conversation_id,
                ConversationStatus::Open,
                &pending,
                already_flushed,
                closed_at,
            )
            .await?;

        let members = self
            .rooms
            .delete_room(RoomKey::for_conversation(conversation_id));
        relay::broadcast(&members, &OutboundEvent::closed(conversation_id), None);
        self.buffers.clear(conversation_id);

        tracing::info!(
            conversation_id,
            notified = members.len(),
            persisted = already_flushed + pending.len(),
            "unassigned conversation closed"
        );

        conversation.status = ConversationStatus::Closed;
        conversation.closed_at = Some(closed_at);
        conversation.updated_at = closed_at;
        Ok(conversation)
    }

    /// Mark the section `Closing` and take the buffered messages not yet in
    /// the log, along with how many already are.
    fn begin_close(&self, section: &mut Section, conversation_id: i64) -> (Vec<ChatMessage>, usize) {
        let mut buffered = self.buffers.drain(conversation_id);
        let pending = buffered.split_off(section.flushed.min(buffered.len()));
        section.phase = Phase::Closing;
        (pending, section.flushed)
    }

    /// Durable half of a close, run with the section released: append
    /// `pending`, then move the status from `from` to `closed`. Returns the
    /// re-taken section marked `Closed`. On failure the section goes back to
    /// `Live` with the buffer intact, remembering what the log already holds.
    async fn commit_close<'a>(
        &self,
        handle: &'a SectionHandle,
        conversation_id: i64,
        from: ConversationStatus,
        pending: &[ChatMessage],
        already_flushed: usize,
        closed_at: DateTime<Utc>,
    ) -> Result<MutexGuard<'a, Section>, CoreError> {
        if let Err(e) = self.log.append_batch(conversation_id, pending).await {
            handle.lock().await.phase = Phase::Live;
            tracing::error!(
                conversation_id,
                pending = pending.len(),
                error = %e,
                "transcript flush failed; conversation stays {}",
                from
            );
            return Err(e.into());
        }

        let status_write = self
            .transition(conversation_id, from, ConversationStatus::Closed, Some(closed_at))
            .await;

        let mut section = handle.lock().await;
        if let Err(err) = status_write {
            section.phase = Phase::Live;
            section.flushed = already_flushed + pending.len();
            tracing::error!(
                conversation_id,
                flushed = section.flushed,
                error = %err,
                "status write failed after flush; conversation stays {}",
                from
            );
            return Err(err);
        }

        section.phase = Phase::Closed;
        section.flushed = 0;
        Ok(section)
    }

    async fn transition(
        &self,
        conversation_id: i64,
        from: ConversationStatus,
        to: ConversationStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<(), CoreError> {
        if !from.can_transition_to(to) {
            return Err(CoreError::conflict(format!(
                "Cannot move conversation from {from} to {to}"
            )));
        }
        let moved = self
            .conversations
            .update_status(conversation_id, from, to, closed_at)
            .await?;
        if moved {
            Ok(())
        } else {
            Err(CoreError::state_changed())
        }
    }

    /// Messages visible for a conversation: the live buffer while assigned,
    /// the persisted log once closed, nothing while still open.
    pub async fn transcript(&self, conversation_id: i64) -> Result<Vec<ChatMessage>, CoreError> {
        let conversation = self.load(conversation_id).await?;
        self.transcript_for(&conversation).await
    }

    pub async fn transcript_for(
        &self,
        conversation: &Conversation,
    ) -> Result<Vec<ChatMessage>, CoreError> {
        match conversation.status {
            ConversationStatus::Open => Ok(Vec::new()),
            ConversationStatus::Assigned => Ok(self.buffers.drain(conversation.id)),
            ConversationStatus::Closed => Ok(self.log.list_for_conversation(conversation.id).await?),
        }
    }

    /// Socket teardown: drop every membership. Transcripts and statuses
    /// are left alone.
    pub fn disconnect(&self, conn: &Connection) {
        let joined = conn.joined_rooms();
        self.rooms.leave_all(conn);
        for key in &joined {
            self.prune(key.conversation_id());
        }
        if !joined.is_empty() {
            tracing::debug!(
                user_id = conn.user_id(),
                connection_id = %conn.id(),
                rooms = joined.len(),
                "connection left all rooms"
            );
        }
    }

    async fn load(&self, conversation_id: i64) -> Result<Conversation, CoreError> {
        self.conversations
            .find_by_id(conversation_id)
            .await?
            .ok_or_else(CoreError::conversation_not_found)
    }

    fn section(&self, conversation_id: i64) -> SectionHandle {
        Arc::clone(&self.sections.entry(conversation_id).or_default())
    }

    fn release(&self, conversation_id: i64, handle: SectionHandle) {
        drop(handle);
        self.prune(conversation_id);
    }

    /// Forget a section nobody holds once it has nothing left to guard, along
    /// with its empty buffer. The map shard stays locked for the check, so no
    /// new holder can appear.
    fn prune(&self, conversation_id: i64) {
        let key = RoomKey::for_conversation(conversation_id);
        self.sections.remove_if(&conversation_id, |_, handle| {
            Arc::strong_count(handle) == 1
                && handle.try_lock().is_ok_and(|section| match section.phase {
                    Phase::Closed => true,
                    Phase::Closing => false,
                    Phase::Live => {
                        let idle = !self.rooms.room_exists(key)
                            && self.buffers.is_empty(conversation_id);
                        if idle {
                            self.buffers.clear(conversation_id);
                        }
                        idle
                    }
                })
        });
    }

    #[cfg(test)]
    fn section_count(&self) -> usize {
        self.sections.len()
    }
}

fn ensure_live(section: &Section) -> Result<(), CoreError> {
    match section.phase {
        Phase::Live => Ok(()),
        Phase::Closing => Err(CoreError::conflict("Conversation is closing")),
        Phase::Closed => Err(CoreError::already_closed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::connection::Frame;
    use async_trait::async_trait;
    use chrono::DateTime;
    use livechat_db::{DatabaseEngine, DbError, DbPool};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, Notify};

    const CONVERSATION: i64 = 100;
    const CANDIDATE: i64 = 1;
    const SUPERVISOR: i64 = 2;
    const AGENT: i64 = 3;
    const OTHER_AGENT: i64 = 4;
    const OTHER_CANDIDATE: i64 = 7;

    async fn seeded_pool() -> DbPool {
        let pool = livechat_db::create_pool("sqlite::memory:", 1)
            .await
            .expect("pool");
        livechat_db::run_migrations_for_engine(&pool, DatabaseEngine::Sqlite)
            .await
            .expect("migrations");
        use livechat_db::users::create_user;
        create_user(&pool, SUPERVISOR, "Sue", "sue@example.com", Role::Supervisor, None)
            .await
            .expect("supervisor");
        create_user(&pool, CANDIDATE, "Cal", "cal@example.com", Role::Candidate, None)
            .await
            .expect("candidate");
        create_user(&pool, AGENT, "Ada", "ada@example.com", Role::Agent, Some(SUPERVISOR))
            .await
            .expect("agent");
        create_user(&pool, OTHER_AGENT, "Bo", "bo@example.com", Role::Agent, Some(SUPERVISOR))
            .await
            .expect("other agent");
        livechat_db::conversations::create_conversation(&pool, CONVERSATION, CANDIDATE, SUPERVISOR)
            .await
            .expect("conversation");
        livechat_db::conversations::assign_agent(&pool, CONVERSATION, AGENT)
            .await
            .expect("assign");
        pool
    }

    async fn manager() -> (ConversationManager, DbPool) {
        let pool = seeded_pool().await;
        let manager = ConversationManager::with_sql_store(SqlStore::new(pool.clone()));
        (manager, pool)
    }

    fn connect(user_id: i64, role: Role) -> (Arc<Connection>, mpsc::Receiver<Frame>) {
        Connection::channel(Identity { user_id, role }, 64)
    }

    fn events(rx: &mut mpsc::Receiver<Frame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            out.push(serde_json::from_str(&frame).expect("frame is json"));
        }
        out
    }

    fn event_names(rx: &mut mpsc::Receiver<Frame>) -> Vec<String> {
        events(rx)
            .into_iter()
            .map(|value| value["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    async fn stored_status(pool: &DbPool) -> ConversationStatus {
        livechat_db::conversations::get_conversation(pool, CONVERSATION)
            .await
            .expect("query")
            .expect("exists")
            .status
    }

    async fn stored_contents(pool: &DbPool) -> Vec<String> {
        livechat_db::messages::list_for_conversation(pool, CONVERSATION)
            .await
            .expect("list")
            .into_iter()
            .map(|row| row.content)
            .collect()
    }

    fn conflict_message(err: CoreError) -> String {
        match err {
            CoreError::Conflict(message) => message,
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn candidate_joins_open_conversation_without_status_change() {
        let (manager, pool) = manager().await;
        let (candidate, mut rx) = connect(CANDIDATE, Role::Candidate);

        let status = manager.join(&candidate, CONVERSATION).await.expect("join");
        assert_eq!(status, ConversationStatus::Open);

        let replies = events(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["event"], "JOINED_CONVERSATION");
        assert_eq!(replies[0]["data"]["conversationId"], "100");
        assert_eq!(replies[0]["data"]["status"], "open");

        let key = RoomKey::for_conversation(CONVERSATION);
        assert!(manager.rooms().contains(key, &candidate));
        assert_eq!(stored_status(&pool).await, ConversationStatus::Open);
    }

    #[tokio::test]
    async fn assigned_agent_join_flips_status_once() {
        let (manager, pool) = manager().await;
        let (agent, mut rx) = connect(AGENT, Role::Agent);

        let status = manager.join(&agent, CONVERSATION).await.expect("join");
        assert_eq!(status, ConversationStatus::Assigned);
        assert_eq!(stored_status(&pool).await, ConversationStatus::Assigned);

        // Rejoining is idempotent.
        let again = manager.join(&agent, CONVERSATION).await.expect("rejoin");
        assert_eq!(again, ConversationStatus::Assigned);
        assert_eq!(
            manager.rooms().members_of(RoomKey::for_conversation(CONVERSATION)).len(),
            1
        );

        let replies = events(&mut rx);
        assert_eq!(replies.len(), 2);
        assert!(replies
            .iter()
            .all(|reply| reply["data"]["status"] == "assigned"));
    }

    #[tokio::test]
    async fn join_rejects_outsiders_and_unknown_conversations() {
        let (manager, _pool) = manager().await;

        let (supervisor, _rx_s) = connect(SUPERVISOR, Role::Supervisor);
        let err = manager.join(&supervisor, CONVERSATION).await.expect_err("supervisor");
        assert!(matches!(err, CoreError::Forbidden(ref m) if m == "Forbidden for this role"));

        let (other, _rx_o) = connect(OTHER_AGENT, Role::Agent);
        let err = manager.join(&other, CONVERSATION).await.expect_err("other agent");
        assert!(matches!(err, CoreError::Forbidden(ref m) if m == "not allowed"));

        let (stranger, _rx_c) = connect(99, Role::Candidate);
        let err = manager.join(&stranger, CONVERSATION).await.expect_err("stranger");
        assert!(matches!(err, CoreError::Forbidden(_)));

        let (candidate, _rx) = connect(CANDIDATE, Role::Candidate);
        let err = manager.join(&candidate, 404).await.expect_err("unknown");
        assert!(matches!(err, CoreError::NotFound(ref m) if m == "Conversation not found"));

        assert_eq!(manager.rooms().room_count(), 0);
        assert_eq!(manager.section_count(), 0);
    }

    #[tokio::test]
    async fn messages_reach_the_room_without_echo() {
        let (manager, _pool) = manager().await;
        let (candidate, mut rx_candidate) = connect(CANDIDATE, Role::Candidate);
        let (agent, mut rx_agent) = connect(AGENT, Role::Agent);
        manager.join(&candidate, CONVERSATION).await.expect("candidate join");
        manager.join(&agent, CONVERSATION).await.expect("agent join");
        events(&mut rx_candidate);
        events(&mut rx_agent);

        let sent = manager
            .send_message(&candidate, CONVERSATION, "  hello there  ")
            .await
            .expect("send");
        assert_eq!(sent.content, "hello there");

        assert!(events(&mut rx_candidate).is_empty());
        let received = events(&mut rx_agent);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["event"], "NEW_MESSAGE");
        assert_eq!(received[0]["data"]["conversationId"], "100");
        assert_eq!(received[0]["data"]["senderId"], "1");
        assert_eq!(received[0]["data"]["senderRole"], "candidate");
        assert_eq!(received[0]["data"]["content"], "hello there");
        assert_eq!(manager.buffers().len(CONVERSATION), 1);
    }

    #[tokio::test]
    async fn send_requires_membership_and_content() {
        let (manager, _pool) = manager().await;
        let (candidate, _rx) = connect(CANDIDATE, Role::Candidate);

        let err = manager
            .send_message(&candidate, CONVERSATION, "hi")
            .await
            .expect_err("not joined");
        assert_eq!(conflict_message(err), "You must join the conversation first");

        manager.join(&candidate, CONVERSATION).await.expect("join");
        let err = manager
            .send_message(&candidate, CONVERSATION, "   ")
            .await
            .expect_err("blank");
        assert!(matches!(err, CoreError::Validation(ref m) if m == "content is required"));

        let long = "x".repeat(4001);
        let err = manager
            .send_message(&candidate, CONVERSATION, &long)
            .await
            .expect_err("too long");
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(manager.buffers().is_empty(CONVERSATION));
    }

    #[tokio::test]
    async fn leave_requires_membership() {
        let (manager, _pool) = manager().await;
        let (candidate, mut rx) = connect(CANDIDATE, Role::Candidate);

        let err = manager.leave(&candidate, CONVERSATION).await.expect_err("not in");
        assert_eq!(conflict_message(err), "You are not in this conversation");

        manager.join(&candidate, CONVERSATION).await.expect("join");
        manager.leave(&candidate, CONVERSATION).await.expect("leave");
        assert_eq!(
            event_names(&mut rx),
            vec!["JOINED_CONVERSATION", "LEFT_CONVERSATION"]
        );
        assert!(!manager
            .rooms()
            .room_exists(RoomKey::for_conversation(CONVERSATION)));
    }

    #[tokio::test]
    async fn close_flushes_transcript_once_and_notifies_room() {
        let (manager, pool) = manager().await;
        let (candidate, mut rx_candidate) = connect(CANDIDATE, Role::Candidate);
        let (agent, mut rx_agent) = connect(AGENT, Role::Agent);
        manager.join(&candidate, CONVERSATION).await.expect("candidate join");
        manager.join(&agent, CONVERSATION).await.expect("agent join");
        manager
            .send_message(&candidate, CONVERSATION, "hello")
            .await
            .expect("send 1");
        manager
            .send_message(&agent, CONVERSATION, "hi, how can I help?")
            .await
            .expect("send 2");
        let buffered = manager.buffers().drain(CONVERSATION);
        events(&mut rx_candidate);
        events(&mut rx_agent);

        manager.close(&agent, CONVERSATION).await.expect("close");

        assert_eq!(event_names(&mut rx_candidate), vec!["CONVERSATION_CLOSED"]);
        assert_eq!(event_names(&mut rx_agent), vec!["CONVERSATION_CLOSED"]);

        let stored = livechat_db::conversations::get_conversation(&pool, CONVERSATION)
            .await
            .expect("query")
            .expect("exists");
        assert_eq!(stored.status, ConversationStatus::Closed);
        assert!(stored.closed_at.is_some());

        let persisted = manager.transcript(CONVERSATION).await.expect("transcript");
        assert_eq!(persisted, buffered);

        let key = RoomKey::for_conversation(CONVERSATION);
        assert!(!manager.rooms().room_exists(key));
        assert!(!candidate.is_in(key));
        assert!(manager.buffers().is_empty(CONVERSATION));
        assert_eq!(manager.section_count(), 0);

        // A second close is rejected without another flush or notification.
        let err = manager.close(&agent, CONVERSATION).await.expect_err("second close");
        assert_eq!(conflict_message(err), "Conversation already closed");
        assert_eq!(stored_contents(&pool).await.len(), 2);
        assert!(events(&mut rx_candidate).is_empty());
    }

    #[tokio::test]
    async fn closed_conversations_reject_joins_and_sends() {
        let (manager, _pool) = manager().await;
        let (candidate, _rx_candidate) = connect(CANDIDATE, Role::Candidate);
        let (agent, _rx_agent) = connect(AGENT, Role::Agent);
        manager.join(&candidate, CONVERSATION).await.expect("candidate join");
        manager.join(&agent, CONVERSATION).await.expect("agent join");
        manager.close(&agent, CONVERSATION).await.expect("close");

        let err = manager.join(&candidate, CONVERSATION).await.expect_err("join");
        assert_eq!(conflict_message(err), "Conversation already closed");

        // Closure is reported before ownership, even to an unrelated candidate.
        let (stranger, _rx_stranger) = connect(OTHER_CANDIDATE, Role::Candidate);
        let err = manager.join(&stranger, CONVERSATION).await.expect_err("stranger");
        assert_eq!(conflict_message(err), "Conversation already closed");

        let err = manager
            .send_message(&candidate, CONVERSATION, "anyone?")
            .await
            .expect_err("send");
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn close_guards_status_and_ownership() {
        let (manager, _pool) = manager().await;
        let (agent, _rx) = connect(AGENT, Role::Agent);
        let (candidate, _rx_c) = connect(CANDIDATE, Role::Candidate);
        let (other, _rx_o) = connect(OTHER_AGENT, Role::Agent);

        let err = manager.close(&agent, CONVERSATION).await.expect_err("still open");
        assert_eq!(conflict_message(err), "Conversation not yet assigned");

        let err = manager.close(&candidate, CONVERSATION).await.expect_err("candidate");
        assert!(matches!(err, CoreError::Forbidden(ref m) if m == "Forbidden for this role"));

        manager.join(&agent, CONVERSATION).await.expect("join");
        let err = manager.close(&other, CONVERSATION).await.expect_err("other agent");
        assert!(matches!(err, CoreError::Forbidden(ref m) if m == "not allowed"));

        // Ownership is checked ahead of the closed status.
        manager.close(&agent, CONVERSATION).await.expect("close");
        let err = manager.close(&other, CONVERSATION).await.expect_err("other agent");
        assert!(matches!(err, CoreError::Forbidden(ref m) if m == "not allowed"));
    }

    #[tokio::test]
    async fn disconnect_drops_memberships_but_keeps_transcript() {
        let (manager, pool) = manager().await;
        let (candidate, _rx) = connect(CANDIDATE, Role::Candidate);
        manager.join(&candidate, CONVERSATION).await.expect("join");
        manager
            .send_message(&candidate, CONVERSATION, "brb")
            .await
            .expect("send");

        manager.disconnect(&candidate);
        manager.disconnect(&candidate);

        assert!(candidate.joined_rooms().is_empty());
        assert_eq!(manager.rooms().room_count(), 0);
        assert_eq!(manager.buffers().len(CONVERSATION), 1);
        assert_eq!(stored_status(&pool).await, ConversationStatus::Open);
        assert!(stored_contents(&pool).await.is_empty());
    }

    #[tokio::test]
    async fn idle_conversations_leave_no_buffer_behind() {
        let (manager, _pool) = manager().await;
        let (candidate, _rx) = connect(CANDIDATE, Role::Candidate);

        manager.join(&candidate, CONVERSATION).await.expect("join");
        manager.leave(&candidate, CONVERSATION).await.expect("leave");
        assert_eq!(manager.buffers().tracked(), 0);
        assert_eq!(manager.section_count(), 0);

        manager.join(&candidate, CONVERSATION).await.expect("rejoin");
        manager.disconnect(&candidate);
        assert_eq!(manager.buffers().tracked(), 0);
        assert_eq!(manager.section_count(), 0);
    }

    #[tokio::test]
    async fn close_unassigned_tears_down_waiting_room() {
        let (manager, pool) = manager().await;
        let (candidate, mut rx) = connect(CANDIDATE, Role::Candidate);
        manager.join(&candidate, CONVERSATION).await.expect("join");
        manager
            .send_message(&candidate, CONVERSATION, "is anyone there?")
            .await
            .expect("send");
        events(&mut rx);

        let closed = manager.close_unassigned(CONVERSATION).await.expect("close");
        assert_eq!(closed.status, ConversationStatus::Closed);
        assert!(closed.closed_at.is_some());

        assert_eq!(event_names(&mut rx), vec!["CONVERSATION_CLOSED"]);
        assert!(!candidate.is_in(RoomKey::for_conversation(CONVERSATION)));
        assert!(manager.buffers().is_empty(CONVERSATION));
        assert_eq!(stored_status(&pool).await, ConversationStatus::Closed);
        assert_eq!(stored_contents(&pool).await, vec!["is anyone there?"]);
        assert_eq!(
            manager.transcript(CONVERSATION).await.expect("transcript").len(),
            1
        );

        let err = manager
            .close_unassigned(CONVERSATION)
            .await
            .expect_err("already closed");
        assert_eq!(
            conflict_message(err),
            "Cannot close conversation with status: closed"
        );
    }

    #[tokio::test]
    async fn close_unassigned_refuses_assigned_conversations() {
        let (manager, pool) = manager().await;
        let (agent, _rx) = connect(AGENT, Role::Agent);
        manager.join(&agent, CONVERSATION).await.expect("join");

        let err = manager
            .close_unassigned(CONVERSATION)
            .await
            .expect_err("assigned");
        assert!(matches!(err, CoreError::Conflict(_)));
        assert_eq!(stored_status(&pool).await, ConversationStatus::Assigned);
    }

    #[tokio::test]
    async fn transcript_follows_status() {
        let (manager, _pool) = manager().await;
        let (candidate, _rx_c) = connect(CANDIDATE, Role::Candidate);
        let (agent, _rx_a) = connect(AGENT, Role::Agent);
        manager.join(&candidate, CONVERSATION).await.expect("join");
        manager
            .send_message(&candidate, CONVERSATION, "waiting")
            .await
            .expect("send");
        assert!(manager.transcript(CONVERSATION).await.expect("open").is_empty());

        manager.join(&agent, CONVERSATION).await.expect("agent join");
        let live = manager.transcript(CONVERSATION).await.expect("assigned");
        assert_eq!(live.len(), 1);

        manager.close(&agent, CONVERSATION).await.expect("close");
        let persisted = manager.transcript(CONVERSATION).await.expect("closed");
        assert_eq!(persisted, live);

        assert!(matches!(
            manager.transcript(404).await,
            Err(CoreError::NotFound(_))
        ));
    }

    /// SqlStore wrapper with switchable failures and an optional pause inside
    /// the transcript append.
    struct FlakyStore {
        inner: SqlStore,
        pool: DbPool,
        /// Hand the conversation to `OTHER_AGENT` just before the next claim.
        reassign_on_claim: AtomicBool,
        fail_append: AtomicBool,
        fail_status: AtomicBool,
        pause_append: AtomicBool,
        append_entered: Notify,
        append_resume: Notify,
    }

    impl FlakyStore {
        fn new(pool: DbPool) -> Arc<Self> {
            Arc::new(Self {
                inner: SqlStore::new(pool.clone()),
                pool,
                reassign_on_claim: AtomicBool::new(false),
                fail_append: AtomicBool::new(false),
                fail_status: AtomicBool::new(false),
                pause_append: AtomicBool::new(false),
                append_entered: Notify::new(),
                append_resume: Notify::new(),
            })
        }
    }

    fn injected() -> DbError {
        DbError::Sqlx(sqlx::Error::PoolTimedOut)
    }

    #[async_trait]
    impl ConversationStore for FlakyStore {
        async fn find_by_id(&self, id: i64) -> Result<Option<Conversation>, DbError> {
            self.inner.find_by_id(id).await
        }

        async fn mark_assigned(&self, id: i64, agent_id: i64) -> Result<bool, DbError> {
            if self.reassign_on_claim.swap(false, Ordering::SeqCst) {
                livechat_db::conversations::assign_agent(&self.pool, id, OTHER_AGENT).await?;
            }
            self.inner.mark_assigned(id, agent_id).await
        }

        async fn update_status(
            &self,
            id: i64,
            expected: ConversationStatus,
            next: ConversationStatus,
            closed_at: Option<DateTime<Utc>>,
        ) -> Result<bool, DbError> {
            if next == ConversationStatus::Closed && self.fail_status.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.update_status(id, expected, next, closed_at).await
        }
    }

    #[async_trait]
    impl MessageLog for FlakyStore {
        async fn append_batch(
            &self,
            conversation_id: i64,
            messages: &[ChatMessage],
        ) -> Result<u64, DbError> {
            if self.pause_append.load(Ordering::SeqCst) {
                self.append_entered.notify_one();
                self.append_resume.notified().await;
            }
            if self.fail_append.load(Ordering::SeqCst) {
                return Err(injected());
            }
            self.inner.append_batch(conversation_id, messages).await
        }

        async fn list_for_conversation(
            &self,
            conversation_id: i64,
        ) -> Result<Vec<ChatMessage>, DbError> {
            self.inner.list_for_conversation(conversation_id).await
        }
    }

    async fn flaky_manager() -> (Arc<ConversationManager>, Arc<FlakyStore>, DbPool) {
        let pool = seeded_pool().await;
        let store = FlakyStore::new(pool.clone());
        let manager = ConversationManager::new(store.clone(), store.clone());
        (Arc::new(manager), store, pool)
    }

    #[tokio::test]
    async fn failed_flush_keeps_conversation_assigned_for_retry() {
        let (manager, store, pool) = flaky_manager().await;
        let (candidate, mut rx_candidate) = connect(CANDIDATE, Role::Candidate);
        let (agent, _rx_agent) = connect(AGENT, Role::Agent);
        manager.join(&candidate, CONVERSATION).await.expect("candidate join");
        manager.join(&agent, CONVERSATION).await.expect("agent join");
        manager
            .send_message(&candidate, CONVERSATION, "one")
            .await
            .expect("send");
        events(&mut rx_candidate);

        store.fail_append.store(true, Ordering::SeqCst);
        let err = manager.close(&agent, CONVERSATION).await.expect_err("flush fails");
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(stored_status(&pool).await, ConversationStatus::Assigned);
        assert_eq!(manager.buffers().len(CONVERSATION), 1);
        assert!(candidate.is_in(RoomKey::for_conversation(CONVERSATION)));
        assert!(events(&mut rx_candidate).is_empty());

        // The room is usable again and the retry persists everything once.
        manager
            .send_message(&agent, CONVERSATION, "two")
            .await
            .expect("send after failure");
        store.fail_append.store(false, Ordering::SeqCst);
        manager.close(&agent, CONVERSATION).await.expect("retry");
        assert_eq!(stored_contents(&pool).await, vec!["one", "two"]);
        assert_eq!(stored_status(&pool).await, ConversationStatus::Closed);
    }

    #[tokio::test]
    async fn failed_status_write_does_not_duplicate_flushed_messages() {
        let (manager, store, pool) = flaky_manager().await;
        let (candidate, _rx_candidate) = connect(CANDIDATE, Role::Candidate);
        let (agent, _rx_agent) = connect(AGENT, Role::Agent);
        manager.join(&candidate, CONVERSATION).await.expect("candidate join");
        manager.join(&agent, CONVERSATION).await.expect("agent join");
        manager
            .send_message(&candidate, CONVERSATION, "first")
            .await
            .expect("send");
        manager
            .send_message(&agent, CONVERSATION, "second")
            .await
            .expect("send");

        store.fail_status.store(true, Ordering::SeqCst);
        let err = manager.close(&agent, CONVERSATION).await.expect_err("status fails");
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(stored_status(&pool).await, ConversationStatus::Assigned);
        assert_eq!(stored_contents(&pool).await, vec!["first", "second"]);

        manager
            .send_message(&candidate, CONVERSATION, "third")
            .await
            .expect("send after failure");
        store.fail_status.store(false, Ordering::SeqCst);
        manager.close(&agent, CONVERSATION).await.expect("retry");
        assert_eq!(
            stored_contents(&pool).await,
            vec!["first", "second", "third"]
        );
    }

    #[tokio::test]
    async fn joins_and_sends_are_rejected_while_closing() {
        let (manager, store, pool) = flaky_manager().await;
        let (candidate, _rx_candidate) = connect(CANDIDATE, Role::Candidate);
        let (agent, _rx_agent) = connect(AGENT, Role::Agent);
        manager.join(&candidate, CONVERSATION).await.expect("candidate join");
        manager.join(&agent, CONVERSATION).await.expect("agent join");
        manager
            .send_message(&candidate, CONVERSATION, "before close")
            .await
            .expect("send");

        store.pause_append.store(true, Ordering::SeqCst);
        let closing = {
            let manager = Arc::clone(&manager);
            let agent = Arc::clone(&agent);
            tokio::spawn(async move { manager.close(&agent, CONVERSATION).await })
        };
        store.append_entered.notified().await;

        let err = manager
            .send_message(&candidate, CONVERSATION, "too late")
            .await
            .expect_err("closing");
        assert_eq!(conflict_message(err), "Conversation is closing");
        let err = manager.join(&candidate, CONVERSATION).await.expect_err("closing");
        assert_eq!(conflict_message(err), "Conversation is closing");

        store.append_resume.notify_one();
        closing.await.expect("task").expect("close");
        assert_eq!(stored_contents(&pool).await, vec!["before close"]);
    }

    #[tokio::test]
    async fn reassignment_before_first_join_locks_out_previous_agent() {
        let (manager, store, pool) = flaky_manager().await;
        let key = RoomKey::for_conversation(CONVERSATION);
        let (previous, _rx_previous) = connect(AGENT, Role::Agent);
        let (current, _rx_current) = connect(OTHER_AGENT, Role::Agent);

        store.reassign_on_claim.store(true, Ordering::SeqCst);
        let err = manager.join(&previous, CONVERSATION).await.expect_err("stale claim");
        assert_eq!(conflict_message(err), "Conversation state changed, try again");
        assert_eq!(stored_status(&pool).await, ConversationStatus::Open);
        assert!(!manager.rooms().room_exists(key));

        let status = manager.join(&current, CONVERSATION).await.expect("new assignee");
        assert_eq!(status, ConversationStatus::Assigned);

        let err = manager.join(&previous, CONVERSATION).await.expect_err("previous agent");
        assert!(matches!(err, CoreError::Forbidden(ref m) if m == "not allowed"));
        let members = manager.rooms().members_of(key);
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].user_id(), OTHER_AGENT);
    }

    #[tokio::test]
    async fn failed_unassigned_close_keeps_waiting_messages_for_retry() {
        let (manager, store, pool) = flaky_manager().await;
        let (candidate, mut rx) = connect(CANDIDATE, Role::Candidate);
        manager.join(&candidate, CONVERSATION).await.expect("join");
        manager
            .send_message(&candidate, CONVERSATION, "hello?")
            .await
            .expect("send");
        events(&mut rx);

        store.fail_append.store(true, Ordering::SeqCst);
        let err = manager
            .close_unassigned(CONVERSATION)
            .await
            .expect_err("flush fails");
        assert!(matches!(err, CoreError::Storage(_)));
        assert_eq!(stored_status(&pool).await, ConversationStatus::Open);
        assert_eq!(manager.buffers().len(CONVERSATION), 1);
        assert!(events(&mut rx).is_empty());

        store.fail_append.store(false, Ordering::SeqCst);
        store.fail_status.store(true, Ordering::SeqCst);
        manager
            .close_unassigned(CONVERSATION)
            .await
            .expect_err("status fails");
        assert_eq!(stored_contents(&pool).await, vec!["hello?"]);
        assert_eq!(stored_status(&pool).await, ConversationStatus::Open);

        store.fail_status.store(false, Ordering::SeqCst);
        manager.close_unassigned(CONVERSATION).await.expect("retry");
        assert_eq!(stored_contents(&pool).await, vec!["hello?"]);
        assert_eq!(stored_status(&pool).await, ConversationStatus::Closed);
        assert_eq!(event_names(&mut rx), vec!["CONVERSATION_CLOSED"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_senders_keep_their_own_order() {
        let (manager, pool) = manager().await;
        let manager = Arc::new(manager);
        let (candidate, _rx_candidate) = connect(CANDIDATE, Role::Candidate);
        let (agent, _rx_agent) = connect(AGENT, Role::Agent);
        manager.join(&candidate, CONVERSATION).await.expect("candidate join");
        manager.join(&agent, CONVERSATION).await.expect("agent join");

        let mut tasks = Vec::new();
        for (conn, label) in [(Arc::clone(&candidate), "c"), (Arc::clone(&agent), "a")] {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                for i in 0..20 {
                    manager
                        .send_message(&conn, CONVERSATION, &format!("{label}{i}"))
                        .await
                        .expect("send");
                }
            }));
        }
        for task in tasks {
            task.await.expect("sender");
        }

        manager.close(&agent, CONVERSATION).await.expect("close");
        let stored = stored_contents(&pool).await;
        assert_eq!(stored.len(), 40);
        for label in ["c", "a"] {
            let own: Vec<&String> = stored.iter().filter(|c| c.starts_with(label)).collect();
            let expected: Vec<String> = (0..20).map(|i| format!("{label}{i}")).collect();
            assert_eq!(own, expected.iter().collect::<Vec<_>>());
        }
    }
}
