// party_sync/server/src/server/instance.rs
use crate::cache::message::{NetworkNotification, PartyNotification};
use crate::cache::{build_cache, Cache, Keyspace};
use crate::concurrent::task_pool::TaskPoolSystem;
use crate::core::config::PartyConfig;
use crate::core::error::{PartyError, PartyResult};
use crate::core::types::{PartyId, PartyRole, PlayerId};
use crate::entities::{Party, PartyPlayer, Promotion};
use crate::network::presence::Presence;
use crate::server::context::SyncContext;
use crate::server::manager::PartyManager;
use crate::server::processor::MessageProcessor;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// One process's view of the party network. Built explicitly and shared
/// behind an `Arc`; nothing here is global.
///
/// The lifecycle methods block on backend I/O. Hosts call them from a worker
/// (see [`PartySyncService::spawn`]), never from a latency-sensitive thread.
/// Each one applies its local change first and then persists, so an `Err`
/// means the local state moved but the network may not have seen it yet;
/// [`PartySyncService::resync_party`] retries the write.
pub struct PartySyncService {
    config: Arc<PartyConfig>,
    ctx: SyncContext,
    manager: Arc<PartyManager>,
    presence: Arc<dyn Presence>,
    processor: Arc<MessageProcessor>,
}

impl PartySyncService {
    /// Builds the configured backend and wires everything to it.
    pub fn new(config: PartyConfig, presence: Arc<dyn Presence>) -> PartyResult<Self> {
        config.validate()?;
        let cache = build_cache(&config.cache)?;
        Self::with_cache(config, cache, presence)
    }

    /// Same as `new` over an existing backend. Several services may share one
    /// `MemoryCache` to stand in for several processes.
    pub fn with_cache(config: PartyConfig, cache: Arc<dyn Cache>, presence: Arc<dyn Presence>) -> PartyResult<Self> {
        info!("Initializing PartySyncService...");
        config.validate()?;

        let tasks = Arc::new(TaskPoolSystem::new(&config.task_pools)?);
        info!(
            "Task pools ready: {} I/O, {} message threads.",
            config.task_pools.io_threads, config.task_pools.message_threads
        );

        let keyspace = Keyspace::new(config.cache.namespace.clone());
        let ctx = SyncContext::new(cache.clone(), keyspace, tasks);
        let manager = Arc::new(PartyManager::new(ctx.clone(), config.party_id.clone()));
        let processor = Arc::new(MessageProcessor::new(manager.clone(), presence.clone()));
        cache.subscribe(processor.clone())?;
        info!(
            "Party sync ready on {:?} backend (standalone: {}).",
            cache.cache_type(),
            config.standalone
        );

        Ok(PartySyncService {
            config: Arc::new(config),
            ctx,
            manager,
            presence,
            processor,
        })
    }

    pub fn config(&self) -> &PartyConfig {
        &self.config
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn manager(&self) -> &Arc<PartyManager> {
        &self.manager
    }

    pub fn processor(&self) -> &Arc<MessageProcessor> {
        &self.processor
    }

    /// Runs a flow on the I/O pool; failures are logged under `label`.
    pub fn spawn<F>(self: &Arc<Self>, label: &'static str, flow: F)
    where
        F: FnOnce(&PartySyncService) -> PartyResult<()> + Send + 'static,
    {
        let service = Arc::clone(self);
        self.ctx.tasks.submit_io(label, move || flow(&service));
    }

    // --- collaborator queries ---

    pub fn party_of_player(&self, player_id: &PlayerId) -> Option<Party> {
        self.manager.local_party_of_player(player_id)
    }

    pub fn party_by_id(&self, party_id: &PartyId) -> Option<Party> {
        self.manager.local_party(party_id)
    }

    pub fn player(&self, player_id: &PlayerId) -> Option<PartyPlayer> {
        self.manager.local_player(player_id)
    }

    pub fn remote_parties(&self) -> PartyResult<Vec<Party>> {
        self.manager.remote_parties()
    }

    pub fn remote_party_players(&self) -> PartyResult<Vec<PartyPlayer>> {
        self.manager.remote_party_players()
    }

    /// Resolves a username, local index first.
    pub fn find_player(&self, name: &str) -> PartyResult<Option<PartyPlayer>> {
        match self.manager.local_player_by_name(name) {
            Some(player) => Ok(Some(player)),
            None => self.manager.remote_player_by_name(name),
        }
    }

    // --- presence lifecycle ---

    /// Indexes a player who just connected here. Backend trouble degrades to
    /// a local-only player instead of failing the join.
    pub fn player_connected(&self, player_id: PlayerId, name: &str) -> PartyPlayer {
        let player = if self.config.standalone {
            self.fresh_player(player_id, name)
        } else {
            self.restore_player(player_id, name)
        };
        self.manager.cache_party_player(player.clone());
        debug!("Indexed {} ({}) as {}", player.name(), player_id, player.role());
        player
    }

    fn fresh_player(&self, player_id: PlayerId, name: &str) -> PartyPlayer {
        let player = PartyPlayer::new(player_id, name, PartyRole::None, self.config.player.prefix.clone());
        if let Err(e) = player.silent_update_now(&self.ctx) {
            warn!("Player {} stays local-only: {}", player_id, e);
        }
        player
    }

    fn restore_player(&self, player_id: PlayerId, name: &str) -> PartyPlayer {
        let stored = match self.manager.remote_party_player(&player_id) {
            Ok(Some(stored)) => stored,
            Ok(None) => return self.fresh_player(player_id, name),
            Err(e) => {
                warn!("Could not restore {}: {}. Continuing local-only.", player_id, e);
                return PartyPlayer::new(player_id, name, PartyRole::None, self.config.player.prefix.clone());
            }
        };

        let mut role = stored.role();
        if stored.in_party() {
            match self.manager.remote_party_of_player(&player_id) {
                Ok(Some(party)) => {
                    role = party.player(&player_id).map(PartyPlayer::role).unwrap_or_default();
                    debug!("Mirroring party {} for returning player {}", party.id(), player_id);
                    let party_id = party.id().clone();
                    self.manager.with_party_lock(&party_id, || self.manager.cache_party(party));
                }
                Ok(None) => {
                    debug!("Player {} carried a stale {} role", player_id, role);
                    role = PartyRole::None;
                }
                Err(e) => warn!("Could not look up the party of {}: {}", player_id, e),
            }
        }

        let player = PartyPlayer::new(player_id, name, role, self.config.player.prefix.clone());
        if let Err(e) = player.silent_update_now(&self.ctx) {
            warn!("Could not refresh stored player {}: {}", player_id, e);
        }
        player
    }

    /// The host saw the player go. A LEADER or the last member connected here
    /// releases the party: standalone disbands it, shared mode only drops the
    /// mirror. The index entry goes after the grace delay unless the player
    /// came back.
    pub fn player_disconnected(&self, player_id: PlayerId) -> PartyResult<()> {
        let mut result: PartyResult<()> = Ok(());
        if let Some(party) = self.manager.local_party_of_player(&player_id) {
            let party_id = party.id().clone();
            result = self.manager.with_party_lock(&party_id, || -> PartyResult<()> {
                let Some(party) = self.manager.local_party(&party_id) else {
                    return Ok(());
                };
                let was_leader = party.player(&player_id).map(PartyPlayer::role) == Some(PartyRole::Leader);
                let others_here = party
                    .players()
                    .any(|p| p.id() != player_id && self.presence.is_online(&p.id()));

                if was_leader || !others_here {
                    if self.config.standalone {
                        return self.dissolve(party).map(|_| ());
                    }
                    self.manager.delete_local_party(&party_id);
                    debug!("Released mirror of party {} after {} left", party_id, player_id);
                }
                Ok(())
            });
        }
        self.schedule_release(player_id);
        result
    }

    fn schedule_release(&self, player_id: PlayerId) {
        let manager = self.manager.clone();
        let presence = self.presence.clone();
        let standalone = self.config.standalone;
        self.ctx
            .tasks
            .submit_io_later("player-release", self.config.disconnect_grace(), move || {
                if presence.is_online(&player_id) {
                    debug!("Player {} reconnected within the grace period", player_id);
                    return Ok(());
                }
                manager.delete_local_player(&player_id);
                if standalone {
                    let ctx = manager.context();
                    ctx.cache.delete(&ctx.keyspace.player_key(&player_id))?;
                }
                Ok(())
            });
    }

    /// The player left the whole network (the proxy's view of a disconnect).
    pub fn player_left_network(&self, player_id: PlayerId) -> PartyResult<()> {
        let party = match self.manager.local_party_of_player(&player_id) {
            Some(party) => Some(party),
            None => self.manager.remote_party_of_player(&player_id)?,
        };

        if let Some(party) = party {
            let party_id = party.id().clone();
            self.manager
                .with_party_lock(&party_id, || self.remove_departed(&party_id, player_id))?;
        }

        // last, so a disband cannot write the snapshot back
        self.ctx.cache.delete(&self.ctx.keyspace.player_key(&player_id))?;
        self.manager.delete_local_player(&player_id);
        Ok(())
    }

    /// Callers hold the party's lock.
    fn remove_departed(&self, party_id: &PartyId, player_id: PlayerId) -> PartyResult<()> {
        let mut party = match self.manager.local_party(party_id) {
            Some(party) => party,
            None => match self.manager.remote_party(party_id)? {
                Some(party) => party,
                None => return Ok(()),
            },
        };

        let role = party.player(&player_id).map(PartyPlayer::role).unwrap_or_default();
        if role == PartyRole::Leader || party.remove_player(&player_id).emptied {
            return self.dissolve(party).map(|_| ());
        }

        // a mirror, if there is one, takes the reduced party as is
        self.manager.with_local_party(party_id, |mirror| *mirror = party.clone());
        party.update_now(&self.ctx)?;
        self.ctx.publish(
            &PartyNotification::Leave {
                party_id: party_id.clone(),
                player_id,
            }
            .into(),
        )
    }

    // --- party lifecycle ---

    pub fn create_party(&self, leader_id: PlayerId) -> PartyResult<Party> {
        let leader = self.require_local_player(&leader_id)?;
        if leader.in_party() || self.manager.local_party_of_player(&leader_id).is_some() {
            return Err(PartyError::NotPermitted(format!("{} is already in a party", leader.name())));
        }

        let party = self.manager.create_local_party(leader)?;
        self.manager.with_party_lock(party.id(), || -> PartyResult<()> {
            party.silent_update_now(&self.ctx)?;
            if let Some(leader) = party.leader() {
                leader.update_now(&self.ctx)?;
            }
            Ok(())
        })?;
        info!("Party {} created by {}", party.id(), leader_id);
        Ok(party)
    }

    /// Invites `target_id`, creating a party for the inviter if needed. The
    /// settling delay for a fresh party runs without holding the party.
    pub fn invite(&self, inviter_id: PlayerId, target_id: PlayerId) -> PartyResult<Party> {
        if inviter_id == target_id {
            return Err(PartyError::NotPermitted("cannot invite yourself".into()));
        }
        let (party, created) = match self.manager.local_party_of_player(&inviter_id) {
            Some(party) => (party, false),
            None => (self.create_party(inviter_id)?, true),
        };

        let inviter = party
            .player(&inviter_id)
            .ok_or_else(|| PartyError::NotFound(format!("{} is not in party {}", inviter_id, party.id())))?;
        if !inviter.role().can_invite() {
            return Err(PartyError::NotPermitted(format!(
                "{} cannot invite as {}",
                inviter.name(),
                inviter.role()
            )));
        }
        let inviter_name = inviter.name().to_string();

        let target = self
            .manager
            .remote_party_player(&target_id)?
            .ok_or_else(|| PartyError::NotFound(format!("player {} is not online", target_id)))?;
        if target.in_party() {
            return Err(PartyError::NotPermitted(format!("{} is already in a party", target.name())));
        }

        if created {
            // let the fresh party settle before other processes hear about it
            let delay = self.config.new_party_invite_delay();
            if !delay.is_zero() {
                thread::sleep(delay);
            }
        }

        let party = self.manager.with_party_lock(party.id(), || -> PartyResult<Party> {
            let party = self
                .manager
                .with_local_party(party.id(), |p| {
                    if p.has_invite(&target_id) {
                        return None;
                    }
                    p.add_invite(target_id);
                    Some(p.clone())
                })
                .ok_or_else(|| PartyError::NotFound(format!("party {} was disbanded", party.id())))?
                .ok_or_else(|| PartyError::NotPermitted(format!("{} is already invited", target.name())))?;
            party.update_now(&self.ctx)?;
            Ok(party)
        })?;
        self.ctx.publish(
            &NetworkNotification::Message {
                players: vec![target_id],
                text: format!("{} has invited you to their party.", inviter_name),
            }
            .into(),
        )?;
        info!("{} invited {} to party {}", inviter_name, target.name(), party.id());
        Ok(party)
    }

    pub fn accept_invite(&self, player_id: PlayerId, inviter_id: PlayerId) -> PartyResult<Party> {
        let player = self.require_local_player(&player_id)?;
        if player.in_party() || self.manager.local_party_of_player(&player_id).is_some() {
            return Err(PartyError::NotPermitted(format!("{} is already in a party", player.name())));
        }

        let found = self
            .manager
            .remote_party_of_player(&inviter_id)?
            .ok_or_else(|| PartyError::NotFound(format!("{} is not in a party", inviter_id)))?;
        let party_id = found.id().clone();

        self.manager.with_party_lock(&party_id, || -> PartyResult<Party> {
            // read again under the lock; the scan may predate a concurrent write
            let mut party = self
                .manager
                .remote_party(&party_id)?
                .ok_or_else(|| PartyError::NotFound(format!("party {} was disbanded", party_id)))?;
            if !party.has_invite(&player_id) {
                return Err(PartyError::NotPermitted(format!(
                    "{} has no pending invite to party {}",
                    player.name(),
                    party_id
                )));
            }

            let member = party.add_player(player, PartyRole::Member).clone();
            self.manager.cache_party(party.clone());
            self.manager.with_local_player(&player_id, |p| p.set_role(PartyRole::Member));

            member.update_now(&self.ctx)?;
            party.update_now(&self.ctx)?;
            self.ctx.publish(
                &PartyNotification::Join {
                    party_id: party_id.clone(),
                    player_id,
                }
                .into(),
            )?;
            info!("{} joined party {}", member.name(), party_id);
            Ok(party)
        })
    }

    /// A leader leaving disbands the party.
    pub fn leave(&self, player_id: PlayerId) -> PartyResult<()> {
        let party = self.require_local_party_of(&player_id)?;
        let party_id = party.id().clone();
        self.manager.with_party_lock(&party_id, || -> PartyResult<()> {
            let party = self.require_local_party(&party_id)?;
            if party.player(&player_id).map(PartyPlayer::role) == Some(PartyRole::Leader) {
                return self.dissolve(party).map(|_| ());
            }

            let removal = self
                .manager
                .with_local_party(&party_id, |p| p.remove_player(&player_id))
                .ok_or_else(|| PartyError::NotFound(format!("party {} was disbanded", party_id)))?;
            let former = removal
                .removed
                .ok_or_else(|| PartyError::NotFound(format!("{} is not in party {}", player_id, party_id)))?;
            self.manager.with_local_player(&player_id, |p| p.set_role(PartyRole::None));

            let remaining = if removal.emptied {
                self.manager.delete_local_party(&party_id);
                None
            } else {
                self.release_unused_mirror(&party_id)
            };

            former.update_now(&self.ctx)?;
            if let Some(remaining) = remaining {
                remaining.silent_update_now(&self.ctx)?;
            }
            self.ctx.publish(
                &PartyNotification::Leave {
                    party_id: party_id.clone(),
                    player_id,
                }
                .into(),
            )?;
            info!("{} left party {}", former.name(), party_id);
            Ok(())
        })
    }

    /// Keeps the mirror only while someone connected here is in the party.
    /// Returns the party's current state either way.
    fn release_unused_mirror(&self, party_id: &PartyId) -> Option<Party> {
        let party = self.manager.local_party(party_id)?;
        if !party.players().any(|p| self.presence.is_online(&p.id())) {
            self.manager.delete_local_party(party_id);
            debug!("Dropped mirror of party {}: no members connected here", party_id);
        }
        Some(party)
    }

    pub fn promote(&self, actor_id: PlayerId, target_id: PlayerId) -> PartyResult<Promotion> {
        let party = self.require_local_party_of(&actor_id)?;
        let party_id = party.id().clone();
        self.manager.with_party_lock(&party_id, || -> PartyResult<Promotion> {
            let (promotion, party) = self
                .manager
                .with_local_party(&party_id, |p| p.promote(&actor_id, &target_id).map(|done| (done, p.clone())))
                .ok_or_else(|| PartyError::NotFound(format!("party {} was disbanded", party_id)))??;

            let changed = match promotion {
                Promotion::ToModerator => vec![target_id],
                Promotion::LeadershipSwapped => vec![actor_id, target_id],
            };
            self.persist_roles(&party, &changed)?;
            party.update_now(&self.ctx)?;
            info!("{:?} in party {} ({} -> {})", promotion, party_id, actor_id, target_id);
            Ok(promotion)
        })
    }

    pub fn transfer(&self, actor_id: PlayerId, target_id: PlayerId) -> PartyResult<()> {
        let party = self.require_local_party_of(&actor_id)?;
        let party_id = party.id().clone();
        self.manager.with_party_lock(&party_id, || -> PartyResult<()> {
            let party = self
                .manager
                .with_local_party(&party_id, |p| p.transfer(&actor_id, &target_id).map(|()| p.clone()))
                .ok_or_else(|| PartyError::NotFound(format!("party {} was disbanded", party_id)))??;

            self.persist_roles(&party, &[actor_id, target_id])?;
            party.update_now(&self.ctx)?;
            info!("Leadership of party {} moved from {} to {}", party_id, actor_id, target_id);
            Ok(())
        })
    }

    fn persist_roles(&self, party: &Party, players: &[PlayerId]) -> PartyResult<()> {
        for id in players {
            if let Some(player) = party.player(id) {
                self.manager.with_local_player(id, |p| p.set_role(player.role()));
                player.update_now(&self.ctx)?;
            }
        }
        Ok(())
    }

    /// Leader only. Returns the former members, all back to NONE.
    pub fn disband(&self, actor_id: PlayerId) -> PartyResult<Vec<PartyPlayer>> {
        let party = self.require_local_party_of(&actor_id)?;
        let party_id = party.id().clone();
        self.manager.with_party_lock(&party_id, || -> PartyResult<Vec<PartyPlayer>> {
            let party = self.require_local_party(&party_id)?;
            if party.player(&actor_id).map(PartyPlayer::role) != Some(PartyRole::Leader) {
                return Err(PartyError::NotPermitted(format!(
                    "{} is not the leader of party {}",
                    actor_id, party_id
                )));
            }
            self.dissolve(party)
        })
    }

    /// Callers hold the party's lock.
    fn dissolve(&self, mut party: Party) -> PartyResult<Vec<PartyPlayer>> {
        self.manager.delete_local_party(party.id());
        let members = party.player_ids();
        for id in &members {
            self.manager.with_local_player(id, |p| p.set_role(PartyRole::None));
        }
        let former = party.disband_now(&self.ctx)?;
        info!("Party {} disbanded ({} members released)", party.id(), members.len());
        Ok(former)
    }

    /// Writes the local state of a party again, e.g. after a failed persist.
    pub fn resync_party(&self, party_id: &PartyId) -> PartyResult<()> {
        self.manager.with_party_lock(party_id, || -> PartyResult<()> {
            let party = self
                .manager
                .local_party(party_id)
                .ok_or_else(|| PartyError::NotFound(format!("party {} is not managed here", party_id)))?;
            for player in party.players() {
                player.silent_update_now(&self.ctx)?;
            }
            party.update_now(&self.ctx)
        })
    }

    // --- network messages ---

    pub fn send_party_message(&self, party_id: &PartyId, text: &str) -> PartyResult<()> {
        let party = match self.manager.local_party(party_id) {
            Some(party) => party,
            None => self
                .manager
                .remote_party(party_id)?
                .ok_or_else(|| PartyError::NotFound(format!("party {} does not exist", party_id)))?,
        };
        self.ctx.publish(
            &NetworkNotification::Message {
                players: party.player_ids(),
                text: text.to_string(),
            }
            .into(),
        )
    }

    pub fn send_to_server(&self, players: &[PlayerId], server: &str) -> PartyResult<()> {
        if players.is_empty() {
            return Ok(());
        }
        self.ctx.publish(
            &NetworkNotification::Connect {
                players: players.to_vec(),
                server: server.to_string(),
            }
            .into(),
        )
    }

    fn require_local_player(&self, player_id: &PlayerId) -> PartyResult<PartyPlayer> {
        self.manager
            .local_player(player_id)
            .ok_or_else(|| PartyError::NotFound(format!("player {} is not connected here", player_id)))
    }

    fn require_local_party(&self, party_id: &PartyId) -> PartyResult<Party> {
        self.manager
            .local_party(party_id)
            .ok_or_else(|| PartyError::NotFound(format!("party {} was disbanded", party_id)))
    }

    fn require_local_party_of(&self, player_id: &PlayerId) -> PartyResult<Party> {
        self.manager
            .local_party_of_player(player_id)
            .ok_or_else(|| PartyError::NotFound(format!("player {} is not in a party", player_id)))
    }
}
