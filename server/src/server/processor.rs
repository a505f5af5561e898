// party_sync/server/src/server/processor.rs
use crate::cache::message::{NetworkNotification, Notification, PartyNotification};
use crate::cache::MessageHandler;
use crate::core::error::PartyResult;
use crate::core::types::{PartyId, PlayerId};
use crate::network::presence::Presence;
use crate::operational::monitoring::metrics;
use crate::server::manager::{PartyManager, Upsert};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What handling one notification did to this process's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaction {
    /// Not relevant here; no backend read happened.
    Ignored,
    MirrorCreated,
    MirrorUpdated,
    MirrorDropped,
    MemberRemoved,
    PlayerUpdated,
    /// Messages or transfers handed to the host, by recipient count.
    Delivered(usize),
}

/// Reconciles local mirrors with broadcast notifications. Decoding happens on
/// the subscriber's thread; anything that may touch the backend runs on the
/// message pool.
#[derive(Clone)]
pub struct MessageProcessor {
    manager: Arc<PartyManager>,
    presence: Arc<dyn Presence>,
}

impl MessageProcessor {
    pub fn new(manager: Arc<PartyManager>, presence: Arc<dyn Presence>) -> Self {
        MessageProcessor { manager, presence }
    }

    /// Applies one notification synchronously. Every branch is idempotent:
    /// receiving the same notification twice leaves the same state. Only the
    /// lock of the party a notification touches is taken, and none at all
    /// when no mirror is involved.
    pub fn handle(&self, notification: &Notification) -> PartyResult<Reaction> {
        match notification {
            Notification::Party(PartyNotification::Disband { party_id }) => Ok(self.on_disband(party_id)),
            Notification::Party(PartyNotification::Join { party_id, player_id }) => self.on_join(party_id, player_id),
            Notification::Party(PartyNotification::Leave { party_id, player_id }) => {
                Ok(self.on_leave(party_id, player_id))
            }
            Notification::Party(PartyNotification::Update { party_id }) => self.on_update(party_id),
            Notification::Party(PartyNotification::UpdatePlayer { player_id }) => self.on_update_player(player_id),
            Notification::Network(NetworkNotification::Message { players, text }) => {
                Ok(self.deliver(players, |id| self.presence.send_message(id, text)))
            }
            Notification::Network(NetworkNotification::Connect { players, server }) => {
                Ok(self.deliver(players, |id| self.presence.transfer(id, server)))
            }
        }
    }

    fn on_disband(&self, party_id: &PartyId) -> Reaction {
        if !self.manager.has_local_party(party_id) {
            return Reaction::Ignored;
        }
        self.manager.with_party_lock(party_id, || match self.manager.delete_local_party(party_id) {
            Some(_) => Reaction::MirrorDropped,
            None => Reaction::Ignored,
        })
    }

    fn on_join(&self, party_id: &PartyId, player_id: &PlayerId) -> PartyResult<Reaction> {
        if !self.presence.is_online(player_id) {
            return Ok(Reaction::Ignored);
        }
        self.manager.with_party_lock(party_id, || -> PartyResult<Reaction> {
            let key = self.manager.context().keyspace.party_key(party_id);
            let Some(snapshot) = self.manager.context().cache.get(&key)? else {
                // disbanded before we got here
                return Ok(Reaction::Ignored);
            };
            Ok(match self.manager.upsert_party(&snapshot)? {
                Upsert::Created => Reaction::MirrorCreated,
                Upsert::Overwritten => Reaction::MirrorUpdated,
            })
        })
    }

    fn on_leave(&self, party_id: &PartyId, player_id: &PlayerId) -> Reaction {
        if !self.manager.has_local_party(party_id) {
            return Reaction::Ignored;
        }
        self.manager.with_party_lock(party_id, || {
            let Some(removal) = self.manager.with_local_party(party_id, |party| party.remove_player(player_id)) else {
                return Reaction::Ignored;
            };
            if removal.emptied {
                self.manager.delete_local_party(party_id);
                return Reaction::MirrorDropped;
            }
            match removal.removed {
                Some(_) => Reaction::MemberRemoved,
                None => Reaction::Ignored,
            }
        })
    }

    fn on_update(&self, party_id: &PartyId) -> PartyResult<Reaction> {
        // no mirror, no fetch
        if !self.manager.has_local_party(party_id) {
            return Ok(Reaction::Ignored);
        }
        self.manager.with_party_lock(party_id, || self.refresh_mirror(party_id))
    }

    fn refresh_mirror(&self, party_id: &PartyId) -> PartyResult<Reaction> {
        // released while we waited for the lock
        if !self.manager.has_local_party(party_id) {
            return Ok(Reaction::Ignored);
        }
        let key = self.manager.context().keyspace.party_key(party_id);
        let Some(snapshot) = self.manager.context().cache.get(&key)? else {
            return Ok(Reaction::Ignored);
        };
        match self.manager.with_local_party(party_id, |party| party.apply_snapshot(&snapshot)) {
            Some(applied) => applied.map(|()| Reaction::MirrorUpdated),
            None => Ok(Reaction::Ignored),
        }
    }

    fn on_update_player(&self, player_id: &PlayerId) -> PartyResult<Reaction> {
        if !self.manager.has_local_player(player_id) {
            return Ok(Reaction::Ignored);
        }
        // roles change inside party flows, so hold the party the player is in here
        match self.manager.local_party_of_player(player_id) {
            Some(party) => self
                .manager
                .with_party_lock(party.id(), || self.refresh_player(player_id)),
            None => self.refresh_player(player_id),
        }
    }

    fn refresh_player(&self, player_id: &PlayerId) -> PartyResult<Reaction> {
        let key = self.manager.context().keyspace.player_key(player_id);
        let Some(snapshot) = self.manager.context().cache.get(&key)? else {
            return Ok(Reaction::Ignored);
        };
        match self.manager.with_local_player(player_id, |player| player.apply_snapshot(&snapshot)) {
            Some(applied) => applied.map(|()| Reaction::PlayerUpdated),
            None => Ok(Reaction::Ignored),
        }
    }

    fn deliver(&self, players: &[PlayerId], send: impl Fn(&PlayerId)) -> Reaction {
        let mut delivered = 0;
        for id in players.iter().filter(|id| self.presence.is_online(id)) {
            send(id);
            delivered += 1;
        }
        if delivered == 0 {
            Reaction::Ignored
        } else {
            Reaction::Delivered(delivered)
        }
    }
}

impl MessageHandler for MessageProcessor {
    fn on_message(&self, channel: &str, payload: &str) {
        metrics::record_received(channel);
        let notification = match Notification::parse(channel, payload) {
            Ok(Some(notification)) => notification,
            Ok(None) => {
                trace!("Ignoring unknown message on '{}': {}", channel, payload);
                return;
            }
            Err(e) => {
                debug!("Dropping malformed message on '{}': {}", channel, e);
                metrics::record_dropped();
                return;
            }
        };

        let processor = self.clone();
        self.manager.context().tasks.submit_message(move || match processor.handle(&notification) {
            Ok(reaction) => trace!("Handled '{}': {:?}", notification, reaction),
            Err(e) => warn!("Could not apply '{}': {}", notification, e),
        });
    }
}
