// party_sync/server/src/server/manager.rs
use crate::cache::snapshot::Snapshot;
use crate::core::config::PartyIdSettings;
use crate::core::constants::MAX_PARTY_ID_ATTEMPTS;
use crate::core::error::{PartyError, PartyResult};
use crate::core::types::{PartyId, PartyRole, PlayerId};
use crate::entities::{Party, PartyPlayer};
use crate::operational::monitoring::metrics;
use crate::server::context::SyncContext;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether `upsert_party` created a new mirror or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Created,
    Overwritten,
}

type PartyLock = Arc<ReentrantMutex<()>>;

/// Per-process views over the parties and players this process tracks, plus
/// the blocking remote lookups. Lookups hand out clones; mutation goes
/// through the `with_*` closures so index entries are never exposed raw.
pub struct PartyManager {
    ctx: SyncContext,
    id_settings: PartyIdSettings,
    local_parties: DashMap<PartyId, Party>,
    local_players: DashMap<PlayerId, PartyPlayer>,
    party_locks: DashMap<PartyId, PartyLock>,
}

impl PartyManager {
    pub fn new(ctx: SyncContext, id_settings: PartyIdSettings) -> Self {
        PartyManager {
            ctx,
            id_settings,
            local_parties: DashMap::new(),
            local_players: DashMap::new(),
            party_locks: DashMap::new(),
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Runs `f` holding the lock of one party. Taken across "change the
    /// mirror, then write it" and across "read the backend, then apply it",
    /// so a fetch never lands on top of a newer local write of the same
    /// party. Other parties are not held up. Reentrant: flows nest.
    pub fn with_party_lock<R>(&self, party_id: &PartyId, f: impl FnOnce() -> R) -> R {
        // clone out of the map before locking so no shard stays borrowed
        let lock = self
            .party_locks
            .entry(party_id.clone())
            .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
            .value()
            .clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);
        self.party_locks.remove_if(party_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    /// Number of parties someone is currently holding or waiting on.
    pub fn held_party_locks(&self) -> usize {
        self.party_locks.len()
    }

    // --- local parties ---

    /// Registers a new party led by `leader`. Nothing is written to the
    /// backend until the caller persists it; the id is only checked against
    /// what is already stored.
    pub fn create_local_party(&self, leader: PartyPlayer) -> PartyResult<Party> {
        let leader_id = leader.id();
        let party = Party::new(self.allocate_party_id()?, leader);
        self.with_local_player(&leader_id, |p| p.set_role(PartyRole::Leader));
        self.cache_party(party.clone());
        debug!("Created local party {} led by {}", party.id(), leader_id);
        Ok(party)
    }

    /// Draws ids until one is unused here and in the backend, so processes
    /// sharing the backend never hand out the same id. An unreachable backend
    /// only gets the local check.
    fn allocate_party_id(&self) -> PartyResult<PartyId> {
        for _ in 0..MAX_PARTY_ID_ATTEMPTS {
            let id = PartyId::generate(&self.id_settings);
            if self.local_parties.contains_key(&id) {
                warn!("Generated party id {} collides locally, drawing again", id);
                continue;
            }
            match self.ctx.cache.get(&self.ctx.keyspace.party_key(&id)) {
                Ok(Some(_)) => warn!("Generated party id {} is already stored, drawing again", id),
                Ok(None) => return Ok(id),
                // degraded to local-only; a locally unique id is the best we can do
                Err(e) if e.is_backend_unavailable() => {
                    warn!("Could not check party id {} against the backend: {}", id, e);
                    return Ok(id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(PartyError::NotPermitted(format!(
            "no free party id after {} attempts",
            MAX_PARTY_ID_ATTEMPTS
        )))
    }

    pub fn cache_party(&self, party: Party) {
        self.local_parties.insert(party.id().clone(), party);
        metrics::set_local_parties(self.local_parties.len());
    }

    /// Creates the mirror from `snapshot` or overwrites the existing one.
    pub fn upsert_party(&self, snapshot: &Snapshot) -> PartyResult<Upsert> {
        let incoming = Party::from_snapshot(snapshot)?;
        let outcome = match self.local_parties.entry(incoming.id().clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().apply_snapshot(snapshot)?;
                Upsert::Overwritten
            }
            Entry::Vacant(entry) => {
                entry.insert(incoming);
                Upsert::Created
            }
        };
        metrics::set_local_parties(self.local_parties.len());
        Ok(outcome)
    }

    pub fn has_local_party(&self, party_id: &PartyId) -> bool {
        self.local_parties.contains_key(party_id)
    }

    pub fn local_party(&self, party_id: &PartyId) -> Option<Party> {
        self.local_parties.get(party_id).map(|entry| entry.value().clone())
    }

    /// Linear scan; the local party set is small.
    pub fn local_party_of_player(&self, player_id: &PlayerId) -> Option<Party> {
        self.local_parties
            .iter()
            .find(|entry| entry.value().has_player(player_id))
            .map(|entry| entry.value().clone())
    }

    pub fn with_local_party<R>(&self, party_id: &PartyId, f: impl FnOnce(&mut Party) -> R) -> Option<R> {
        self.local_parties.get_mut(party_id).map(|mut entry| f(entry.value_mut()))
    }

    /// Local index only; the backend is untouched.
    pub fn delete_local_party(&self, party_id: &PartyId) -> Option<Party> {
        let removed = self.local_parties.remove(party_id).map(|(_, party)| party);
        metrics::set_local_parties(self.local_parties.len());
        removed
    }

    pub fn local_parties(&self) -> Vec<Party> {
        self.local_parties.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn local_party_count(&self) -> usize {
        self.local_parties.len()
    }

    /// A transient party for inspection; it is not registered.
    pub fn load_party_from_snapshot(&self, snapshot: &Snapshot) -> PartyResult<Party> {
        Party::from_snapshot(snapshot)
    }

    // --- local players ---

    pub fn cache_party_player(&self, player: PartyPlayer) {
        self.local_players.insert(player.id(), player);
    }

    pub fn has_local_player(&self, player_id: &PlayerId) -> bool {
        self.local_players.contains_key(player_id)
    }

    pub fn local_player(&self, player_id: &PlayerId) -> Option<PartyPlayer> {
        self.local_players.get(player_id).map(|entry| entry.value().clone())
    }

    pub fn local_player_by_name(&self, name: &str) -> Option<PartyPlayer> {
        self.local_players
            .iter()
            .find(|entry| entry.value().name().eq_ignore_ascii_case(name))
            .map(|entry| entry.value().clone())
    }

    pub fn with_local_player<R>(&self, player_id: &PlayerId, f: impl FnOnce(&mut PartyPlayer) -> R) -> Option<R> {
        self.local_players.get_mut(player_id).map(|mut entry| f(entry.value_mut()))
    }

    pub fn delete_local_player(&self, player_id: &PlayerId) -> Option<PartyPlayer> {
        self.local_players.remove(player_id).map(|(_, player)| player)
    }

    pub fn local_player_count(&self) -> usize {
        self.local_players.len()
    }

    // --- remote (blocking: call from a worker, never a latency-sensitive thread) ---

    pub fn remote_party(&self, party_id: &PartyId) -> PartyResult<Option<Party>> {
        self.ctx
            .cache
            .get(&self.ctx.keyspace.party_key(party_id))?
            .map(|snapshot| Party::from_snapshot(&snapshot))
            .transpose()
    }

    pub fn remote_party_player(&self, player_id: &PlayerId) -> PartyResult<Option<PartyPlayer>> {
        self.ctx
            .cache
            .get(&self.ctx.keyspace.player_key(player_id))?
            .map(|snapshot| PartyPlayer::from_snapshot(&snapshot))
            .transpose()
    }

    /// Full prefix scan of every stored party. Unreadable entries are skipped.
    pub fn remote_parties(&self) -> PartyResult<Vec<Party>> {
        let snapshots = self.ctx.cache.scan(&self.ctx.keyspace.party_prefix())?;
        Ok(decode_all(snapshots, Party::from_snapshot))
    }

    /// Full prefix scan of every stored party player.
    pub fn remote_party_players(&self) -> PartyResult<Vec<PartyPlayer>> {
        let snapshots = self.ctx.cache.scan(&self.ctx.keyspace.player_prefix())?;
        Ok(decode_all(snapshots, |s| PartyPlayer::from_snapshot(s)))
    }

    pub fn remote_party_of_player(&self, player_id: &PlayerId) -> PartyResult<Option<Party>> {
        Ok(self.remote_parties()?.into_iter().find(|party| party.has_player(player_id)))
    }

    pub fn remote_player_by_name(&self, name: &str) -> PartyResult<Option<PartyPlayer>> {
        Ok(self
            .remote_party_players()?
            .into_iter()
            .find(|player| player.name().eq_ignore_ascii_case(name)))
    }
}

fn decode_all<T>(snapshots: Vec<Snapshot>, decode: impl Fn(&Snapshot) -> PartyResult<T>) -> Vec<T> {
    snapshots
        .iter()
        .filter_map(|snapshot| match decode(snapshot) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Skipping unreadable remote snapshot: {}", e);
                None
            }
        })
        .collect()
}
