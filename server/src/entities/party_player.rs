// party_sync/server/src/entities/party_player.rs
use crate::cache::message::PartyNotification;
use crate::cache::snapshot::Snapshot;
use crate::core::error::{PartyError, PartyResult};
use crate::core::types::{PartyRole, PlayerId};
use crate::server::context::SyncContext;
use serde_json::Value;

/// A player as the party system sees them. Lives on (with role NONE) while
/// the player is in no party.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyPlayer {
    id: PlayerId,
    name: String,
    role: PartyRole,
    prefix: Option<String>,
}

impl PartyPlayer {
    pub fn new(id: PlayerId, name: impl Into<String>, role: PartyRole, prefix: Option<String>) -> Self {
        PartyPlayer {
            id,
            name: name.into(),
            role,
            prefix,
        }
    }

    pub fn id(&self) -> PlayerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> PartyRole {
        self.role
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Local only; call `update` to share it.
    pub fn set_role(&mut self, role: PartyRole) {
        self.role = role;
    }

    pub fn in_party(&self) -> bool {
        self.role != PartyRole::None
    }

    pub fn to_snapshot(&self) -> Snapshot {
        let prefix = match &self.prefix {
            Some(prefix) => Value::String(prefix.clone()),
            None => Value::Null,
        };
        Snapshot::new()
            .append("uuid", self.id.to_string())
            .append("username", self.name.clone())
            .append("role", self.role.as_str())
            .append("prefix", prefix)
    }

    pub fn from_snapshot(snapshot: &Snapshot) -> PartyResult<Self> {
        let raw_id = snapshot.get_str("uuid")?;
        let id = raw_id
            .parse::<PlayerId>()
            .map_err(|e| PartyError::MalformedSnapshot(format!("bad uuid '{}': {}", raw_id, e)))?;

        Ok(PartyPlayer {
            id,
            name: snapshot.get_str("username")?.to_string(),
            role: parse_role(snapshot)?,
            prefix: snapshot.get_optional_str("prefix")?.map(str::to_string),
        })
    }

    /// Takes the role from a fetched snapshot. Name and prefix belong to the
    /// process the player is connected to and are left alone.
    pub fn apply_snapshot(&mut self, snapshot: &Snapshot) -> PartyResult<()> {
        self.role = parse_role(snapshot)?;
        Ok(())
    }

    /// Persists and broadcasts `updateplayer`, reporting failures.
    pub fn update_now(&self, ctx: &SyncContext) -> PartyResult<()> {
        self.silent_update_now(ctx)?;
        ctx.publish(&PartyNotification::UpdatePlayer { player_id: self.id }.into())
    }

    /// Persists without broadcasting.
    pub fn silent_update_now(&self, ctx: &SyncContext) -> PartyResult<()> {
        ctx.store(&ctx.keyspace.player_key(&self.id), &self.to_snapshot())
    }

    pub fn update(&self, ctx: &SyncContext) {
        let player = self.clone();
        let job_ctx = ctx.clone();
        ctx.tasks.submit_io("player-update", move || player.update_now(&job_ctx));
    }

    pub fn silent_update(&self, ctx: &SyncContext) {
        let player = self.clone();
        let job_ctx = ctx.clone();
        ctx.tasks.submit_io("player-silent-update", move || player.silent_update_now(&job_ctx));
    }
}

fn parse_role(snapshot: &Snapshot) -> PartyResult<PartyRole> {
    snapshot
        .get_str("role")?
        .parse::<PartyRole>()
        .map_err(PartyError::MalformedSnapshot)
}
