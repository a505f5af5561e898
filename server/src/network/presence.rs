// party_sync/server/src/network/presence.rs
use crate::core::types::PlayerId;
use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use std::sync::Arc;

/// What the hosting game server tells the party layer about its own players.
pub trait Presence: Send + Sync {
    /// Is the player connected to this process right now?
    fn is_online(&self, player_id: &PlayerId) -> bool;
    fn send_message(&self, player_id: &PlayerId, text: &str);
    /// Ask the host to move the player to another server.
    fn transfer(&self, player_id: &PlayerId, server: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Message { player_id: PlayerId, text: String },
    Transfer { player_id: PlayerId, server: String },
}

/// In-process presence: connected players plus a lock-free outbox of
/// deliveries the host drains on its own schedule.
pub struct LocalPresence {
    online: DashMap<PlayerId, String>,
    outbox: Arc<SegQueue<PresenceEvent>>,
}

impl LocalPresence {
    pub fn new() -> Self {
        LocalPresence {
            online: DashMap::new(),
            outbox: Arc::new(SegQueue::new()),
        }
    }

    pub fn mark_online(&self, player_id: PlayerId, name: impl Into<String>) {
        self.online.insert(player_id, name.into());
    }

    pub fn mark_offline(&self, player_id: &PlayerId) {
        self.online.remove(player_id);
    }

    pub fn name_of(&self, player_id: &PlayerId) -> Option<String> {
        self.online.get(player_id).map(|entry| entry.value().clone())
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    pub fn pop_event(&self) -> Option<PresenceEvent> {
        self.outbox.pop()
    }

    pub fn drain_events(&self, max_count: usize) -> Vec<PresenceEvent> {
        let mut batch = Vec::with_capacity(max_count.min(self.outbox.len()));
        while batch.len() < max_count {
            match self.outbox.pop() {
                Some(event) => batch.push(event),
                None => break,
            }
        }
        batch
    }

    pub fn pending_events(&self) -> usize {
        self.outbox.len()
    }
}

impl Default for LocalPresence {
    fn default() -> Self {
        Self::new()
    }
}

impl Presence for LocalPresence {
    fn is_online(&self, player_id: &PlayerId) -> bool {
        self.online.contains_key(player_id)
    }

    fn send_message(&self, player_id: &PlayerId, text: &str) {
        if self.is_online(player_id) {
            self.outbox.push(PresenceEvent::Message {
                player_id: *player_id,
                text: text.to_string(),
            });
        }
    }

    fn transfer(&self, player_id: &PlayerId, server: &str) {
        if self.is_online(player_id) {
            self.outbox.push(PresenceEvent::Transfer {
                player_id: *player_id,
                server: server.to_string(),
            });
        }
    }
}
