// party_sync/server/src/entities/party.rs
use super::party_player::PartyPlayer;
use crate::cache::message::PartyNotification;
use crate::cache::snapshot::Snapshot;
use crate::core::error::{PartyError, PartyResult};
use crate::core::types::{PartyId, PartyRole, PlayerId};
use crate::server::context::SyncContext;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Result of removing a member. `emptied` means the party is now logically
/// disbanded and must not be persisted again.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct Removal {
    pub removed: Option<PartyPlayer>,
    pub emptied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// A MEMBER became MODERATOR.
    ToModerator,
    /// A MODERATOR became LEADER and the acting leader stepped down to MODERATOR.
    LeadershipSwapped,
}

/// Members and invites are kept ordered so equal parties produce identical
/// snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Party {
    id: PartyId,
    players: BTreeMap<PlayerId, PartyPlayer>,
    invites: BTreeSet<PlayerId>,
}

impl Party {
    /// A new party with `leader` as its only member, holding LEADER.
    pub fn new(id: PartyId, leader: PartyPlayer) -> Self {
        let mut party = Party {
            id,
            players: BTreeMap::new(),
            invites: BTreeSet::new(),
        };
        party.add_player(leader, PartyRole::Leader);
        party
    }

    pub fn id(&self) -> &PartyId {
        &self.id
    }

    pub fn players(&self) -> impl Iterator<Item = &PartyPlayer> {
        self.players.values()
    }

    pub fn player_ids(&self) -> Vec<PlayerId> {
        self.players.keys().copied().collect()
    }

    pub fn player(&self, player_id: &PlayerId) -> Option<&PartyPlayer> {
        self.players.get(player_id)
    }

    pub fn player_by_name(&self, name: &str) -> Option<&PartyPlayer> {
        self.players.values().find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn has_player(&self, player_id: &PlayerId) -> bool {
        self.players.contains_key(player_id)
    }

    pub fn leader(&self) -> Option<&PartyPlayer> {
        self.players.values().find(|p| p.role() == PartyRole::Leader)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn invites(&self) -> impl Iterator<Item = &PlayerId> {
        self.invites.iter()
    }

    pub fn has_invite(&self, player_id: &PlayerId) -> bool {
        self.invites.contains(player_id)
    }

    /// Inserts or replaces the member with `role` and drops any pending
    /// invite for them. Synchronizing is up to the caller.
    pub fn add_player(&mut self, mut player: PartyPlayer, role: PartyRole) -> &PartyPlayer {
        let id = player.id();
        player.set_role(role);
        self.invites.remove(&id);
        self.players.insert(id, player);
        &self.players[&id]
    }

    pub fn remove_player(&mut self, player_id: &PlayerId) -> Removal {
        let removed = self.players.remove(player_id).map(|mut player| {
            player.set_role(PartyRole::None);
            player
        });
        Removal {
            removed,
            emptied: self.players.is_empty(),
        }
    }

    /// Returns false (and changes nothing) when `player_id` is already a
    /// member; callers are expected to check that first.
    pub fn add_invite(&mut self, player_id: PlayerId) -> bool {
        if self.players.contains_key(&player_id) {
            warn!("Refusing to invite {} to party {}: already a member.", player_id, self.id);
            return false;
        }
        self.invites.insert(player_id)
    }

    pub fn remove_invite(&mut self, player_id: &PlayerId) -> bool {
        self.invites.remove(player_id)
    }

    pub fn set_role(&mut self, player_id: &PlayerId, role: PartyRole) -> bool {
        match self.players.get_mut(player_id) {
            Some(player) => {
                player.set_role(role);
                true
            }
            None => false,
        }
    }

    /// MEMBER → MODERATOR; MODERATOR → LEADER with the actor stepping down.
    pub fn promote(&mut self, actor: &PlayerId, target: &PlayerId) -> PartyResult<Promotion> {
        let target_role = self.check_leadership_change(actor, target)?;
        if target_role == PartyRole::Member {
            self.set_role(target, PartyRole::Moderator);
            return Ok(Promotion::ToModerator);
        }
        self.swap_leader(actor, target);
        Ok(Promotion::LeadershipSwapped)
    }

    /// Hands leadership to `target` whatever their current role.
    pub fn transfer(&mut self, actor: &PlayerId, target: &PlayerId) -> PartyResult<()> {
        self.check_leadership_change(actor, target)?;
        self.swap_leader(actor, target);
        Ok(())
    }

    fn check_leadership_change(&self, actor: &PlayerId, target: &PlayerId) -> PartyResult<PartyRole> {
        match self.players.get(actor) {
            Some(p) if p.role() == PartyRole::Leader => {}
            Some(_) => return Err(PartyError::NotPermitted(format!("{} is not the leader of {}", actor, self.id))),
            None => return Err(PartyError::NotFound(format!("{} is not in party {}", actor, self.id))),
        }
        if actor == target {
            return Err(PartyError::NotPermitted("cannot change your own role".into()));
        }
        self.players
            .get(target)
            .map(PartyPlayer::role)
            .ok_or_else(|| PartyError::NotFound(format!("{} is not in party {}", target, self.id)))
    }

    fn swap_leader(&mut self, actor: &PlayerId, target: &PlayerId) {
        self.set_role(actor, PartyRole::Moderator);
        self.set_role(target, PartyRole::Leader);
    }

    pub fn to_snapshot(&self) -> Snapshot {
        let players = self
            .players
            .values()
            .fold(Snapshot::new(), |doc, p| doc.append_snapshot(&p.id().to_string(), p.to_snapshot()));
        let invites: Vec<String> = self.invites.iter().map(|id| id.to_string()).collect();

        Snapshot::new()
            .append("nanoID", self.id.as_str())
            .append_snapshot("players", players)
            .append("invites", invites)
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> PartyResult<Self> {
        let raw_id = snapshot.get_str("nanoID")?;
        let id = raw_id.parse::<PartyId>().map_err(PartyError::MalformedSnapshot)?;
        let (players, invites) = decode_membership(snapshot)?;
        Ok(Party { id, players, invites })
    }

    /// Destructive overwrite of members and invites from a fetched snapshot.
    /// A malformed or foreign snapshot leaves the mirror untouched.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> PartyResult<()> {
        let snapshot_id = snapshot.get_str("nanoID")?;
        if snapshot_id != self.id.as_str() {
            return Err(PartyError::MalformedSnapshot(format!(
                "snapshot for '{}' applied to party '{}'",
                snapshot_id, self.id
            )));
        }
        let (players, invites) = decode_membership(snapshot)?;
        self.players.clear();
        self.invites.clear();
        self.players = players;
        self.invites = invites;
        Ok(())
    }

    /// Persists and broadcasts `update`, reporting failures.
    pub fn update_now(&self, ctx: &SyncContext) -> PartyResult<()> {
        self.silent_update_now(ctx)?;
        ctx.publish(&PartyNotification::Update { party_id: self.id.clone() }.into())
    }

    /// Persists without broadcasting.
    pub fn silent_update_now(&self, ctx: &SyncContext) -> PartyResult<()> {
        if self.is_empty() {
            // zero members means disbanded; never resurrect the record
            debug!("Skipping persist of empty party {}", self.id);
            return Ok(());
        }
        ctx.store(&ctx.keyspace.party_key(&self.id), &self.to_snapshot())
    }

    pub fn update(&self, ctx: &SyncContext) {
        let party = self.clone();
        let job_ctx = ctx.clone();
        ctx.tasks.submit_io("party-update", move || party.update_now(&job_ctx));
    }

    pub fn silent_update(&self, ctx: &SyncContext) {
        let party = self.clone();
        let job_ctx = ctx.clone();
        ctx.tasks.submit_io("party-silent-update", move || party.silent_update_now(&job_ctx));
    }

    /// Resets every member to NONE and empties the party. Returns the former
    /// members so their new role can be persisted.
    fn dissolve(&mut self) -> Vec<PartyPlayer> {
        self.invites.clear();
        std::mem::take(&mut self.players)
            .into_values()
            .map(|mut player| {
                player.set_role(PartyRole::None);
                player
            })
            .collect()
    }

    /// Disbands and reports the first backend failure. Every step is still
    /// attempted so a partial outage leaves as little behind as possible.
    pub fn disband_now(&mut self, ctx: &SyncContext) -> PartyResult<Vec<PartyPlayer>> {
        let former = self.dissolve();
        let result = disband_remote(&self.id, &former, ctx);
        result.map(|()| former)
    }

    /// Local reset happens now; backend cleanup runs on the I/O pool.
    pub fn disband(&mut self, ctx: &SyncContext) -> Vec<PartyPlayer> {
        let former = self.dissolve();
        let id = self.id.clone();
        let job_players = former.clone();
        let job_ctx = ctx.clone();
        ctx.tasks
            .submit_io("party-disband", move || disband_remote(&id, &job_players, &job_ctx));
        former
    }
}

fn disband_remote(id: &PartyId, former: &[PartyPlayer], ctx: &SyncContext) -> PartyResult<()> {
    let mut first_error = None;
    let mut note = |result: PartyResult<()>| {
        if let Err(e) = result {
            first_error.get_or_insert(e);
        }
    };

    note(ctx.cache.delete(&ctx.keyspace.party_key(id)));
    note(ctx.publish(&PartyNotification::Disband { party_id: id.clone() }.into()));
    for player in former {
        note(player.update_now(ctx));
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

type Membership = (BTreeMap<PlayerId, PartyPlayer>, BTreeSet<PlayerId>);

fn decode_membership(snapshot: &Snapshot) -> PartyResult<Membership> {
    let players_doc = snapshot.get_snapshot("players")?;
    let mut players = BTreeMap::new();
    for key in players_doc.keys() {
        let player = PartyPlayer::from_snapshot(&players_doc.get_snapshot(key)?)?;
        players.insert(player.id(), player);
    }

    let mut invites = BTreeSet::new();
    for raw in snapshot.get_str_list("invites")? {
        let id = raw
            .parse::<PlayerId>()
            .map_err(|e| PartyError::MalformedSnapshot(format!("bad invite '{}': {}", raw, e)))?;
        if !players.contains_key(&id) {
            invites.insert(id);
        }
    }
    Ok((players, invites))
}
