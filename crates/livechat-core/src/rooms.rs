use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionId};

/// Live room name for one conversation, rendered as `conversation:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoomKey(i64);

impl RoomKey {
    pub fn for_conversation(conversation_id: i64) -> Self {
        Self(conversation_id)
    }

    pub fn conversation_id(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conversation:{}", self.0)
    }
}

/// Room -> members. Each change to a room is mirrored onto the member's own
/// joined-room set while the room's shard is still held, so the two views
/// never disagree.
pub struct RoomRegistry {
    rooms: DashMap<RoomKey, HashMap<ConnectionId, Arc<Connection>>>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
        }
    }

    pub fn join(&self, key: RoomKey, conn: &Arc<Connection>) {
        let mut members = self.rooms.entry(key).or_default();
        members.insert(conn.id(), Arc::clone(conn));
        conn.record_join(key);
    }

    pub fn leave(&self, key: RoomKey, conn: &Connection) {
        let now_empty = match self.rooms.get_mut(&key) {
            Some(mut members) => {
                members.remove(&conn.id());
                conn.record_leave(key);
                members.is_empty()
            }
            None => {
                conn.record_leave(key);
                false
            }
        };
        if now_empty {
            self.rooms.remove_if(&key, |_, members| members.is_empty());
        }
    }

    /// Drop the connection from every room it joined. Safe to repeat.
    pub fn leave_all(&self, conn: &Connection) {
        for key in conn.joined_rooms() {
            self.leave(key, conn);
        }
    }

    pub fn members_of(&self, key: RoomKey) -> Vec<Arc<Connection>> {
        self.rooms
            .get(&key)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove the room and clear it from each former member.
    pub fn delete_room(&self, key: RoomKey) -> Vec<Arc<Connection>> {
        let Some((_, members)) = self.rooms.remove(&key) else {
            return Vec::new();
        };
        let members: Vec<Arc<Connection>> = members.into_values().collect();
        for member in &members {
            member.record_leave(key);
        }
        members
    }

    pub fn contains(&self, key: RoomKey, conn: &Connection) -> bool {
        self.rooms
            .get(&key)
            .is_some_and(|members| members.contains_key(&conn.id()))
    }

    pub fn room_exists(&self, key: RoomKey) -> bool {
        self.rooms.contains_key(&key)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
