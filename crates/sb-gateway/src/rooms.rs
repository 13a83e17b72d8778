use crate::ws::messages::ServerEnvelope;
use std::collections::HashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Ephemeral identity of one client transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Cheap handle to a connection's outbound queue. Channels hold these only
/// through room membership, never across calls: delivery is an enqueue onto
/// the connection's writer task, so broadcast never blocks.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerEnvelope>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    /// Enqueue one envelope; `false` once the connection is gone.
    pub fn send(&self, envelope: ServerEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

/// Broadcast addressing: room key → subscribed connections.
///
/// Synchronous and lock-scoped so callers can hold a session lock across
/// `join` + an initial `send`, making replay hand-off atomic with respect
/// to concurrent broadcasts.
pub struct Rooms {
    inner: std::sync::RwLock<HashMap<String, HashMap<ConnectionId, ConnectionHandle>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self {
            inner: std::sync::RwLock::new(HashMap::new()),
        }
    }

    pub fn join(&self, room: &str, conn: &ConnectionHandle) {
        let mut rooms = self.inner.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn.id, conn.clone());
    }

    pub fn leave(&self, room: &str, id: ConnectionId) {
        let mut rooms = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Remove a connection from every room; returns the rooms it was in.
    pub fn leave_all(&self, id: ConnectionId) -> Vec<String> {
        let mut rooms = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let mut left = Vec::new();
        rooms.retain(|room, members| {
            if members.remove(&id).is_some() {
                left.push(room.clone());
            }
            !members.is_empty()
        });
        left
    }

    pub fn broadcast(&self, room: &str, envelope: &ServerEnvelope) {
        let rooms = self.inner.read().unwrap_or_else(|e| e.into_inner());
        if let Some(members) = rooms.get(room) {
            for member in members.values() {
                member.send(envelope.clone());
            }
        }
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .map(|m| m.len())
            .unwrap_or(0)
    }

    pub fn contains(&self, room: &str, id: ConnectionId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(room)
            .is_some_and(|m| m.contains_key(&id))
    }
}

impl Default for Rooms {
    fn default() -> Self {
        Self::new()
    }
}
