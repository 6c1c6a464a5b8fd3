use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Identity;
use crate::rooms::RoomKey;

pub type ConnectionId = Uuid;

/// Serialized outbound frame shared between recipients of a broadcast.
pub type Frame = Arc<str>;

/// Server-side handle for one live socket. The writer task owns the
/// receiving half of `tx`; everything else only ever enqueues.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    tx: mpsc::Sender<Frame>,
    rooms: Mutex<HashSet<RoomKey>>,
    dropped: AtomicU64,
}

impl Connection {
    pub fn new(identity: Identity, tx: mpsc::Sender<Frame>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            tx,
            rooms: Mutex::new(HashSet::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Handle plus the receiving end of a bounded outbound queue.
    pub fn channel(identity: Identity, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Arc::new(Self::new(identity, tx)), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn user_id(&self) -> i64 {
        self.identity.user_id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Non-blocking enqueue. A full or closed queue drops the frame.
    pub(crate) fn deliver(&self, frame: Frame) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_in(&self, key: RoomKey) -> bool {
        self.rooms.lock().contains(&key)
    }

    pub fn joined_rooms(&self) -> Vec<RoomKey> {
        self.rooms.lock().iter().copied().collect()
    }

    pub(crate) fn record_join(&self, key: RoomKey) {
        self.rooms.lock().insert(key);
    }

    pub(crate) fn record_leave(&self, key: RoomKey) {
        self.rooms.lock().remove(&key);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("role", &self.identity.role)
            .finish()
    }
}
