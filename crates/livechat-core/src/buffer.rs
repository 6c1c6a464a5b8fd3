use dashmap::DashMap;
use livechat_models::message::ChatMessage;

/// Conversation -> messages sent live but not yet written to the log.
pub struct MessageBuffer {
    pending: DashMap<i64, Vec<ChatMessage>>,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    pub fn ensure(&self, conversation_id: i64) {
        self.pending.entry(conversation_id).or_default();
    }

    pub fn append(&self, conversation_id: i64, message: ChatMessage) {
        self.pending.entry(conversation_id).or_default().push(message);
    }

    /// Copy of the buffered transcript; the buffer itself is untouched.
    pub fn drain(&self, conversation_id: i64) -> Vec<ChatMessage> {
        self.pending
            .get(&conversation_id)
            .map(|messages| messages.clone())
            .unwrap_or_default()
    }

    pub fn clear(&self, conversation_id: i64) {
        self.pending.remove(&conversation_id);
    }

    pub fn len(&self, conversation_id: i64) -> usize {
        self.pending
            .get(&conversation_id)
            .map_or(0, |messages| messages.len())
    }

    pub fn is_empty(&self, conversation_id: i64) -> bool {
        self.len(conversation_id) == 0
    }

    /// Conversations currently holding a buffer, empty or not.
    pub fn tracked(&self) -> usize {
        self.pending.len()
    }
}
