// party_sync/server/src/cache/message.rs
//
// Wire grammar of the broadcast channels. Payloads are space-delimited text
// naming ids only; receivers fetch state themselves.
use crate::core::constants::{NETWORK_CHANNEL, PARTY_CHANNEL};
use crate::core::error::{PartyError, PartyResult};
use crate::core::types::{PartyId, PlayerId};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartyNotification {
    Disband { party_id: PartyId },
    Join { party_id: PartyId, player_id: PlayerId },
    Leave { party_id: PartyId, player_id: PlayerId },
    Update { party_id: PartyId },
    UpdatePlayer { player_id: PlayerId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkNotification {
    Message { players: Vec<PlayerId>, text: String },
    Connect { players: Vec<PlayerId>, server: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Party(PartyNotification),
    Network(NetworkNotification),
}

impl Notification {
    /// `Ok(None)` for channels and commands this build does not know.
    pub fn parse(channel: &str, payload: &str) -> PartyResult<Option<Notification>> {
        match channel {
            PARTY_CHANNEL => Ok(PartyNotification::parse(payload)?.map(Notification::Party)),
            NETWORK_CHANNEL => Ok(NetworkNotification::parse(payload)?.map(Notification::Network)),
            _ => Ok(None),
        }
    }

    pub fn channel(&self) -> &'static str {
        match self {
            Notification::Party(_) => PARTY_CHANNEL,
            Notification::Network(_) => NETWORK_CHANNEL,
        }
    }
}

impl From<PartyNotification> for Notification {
    fn from(n: PartyNotification) -> Self {
        Notification::Party(n)
    }
}

impl From<NetworkNotification> for Notification {
    fn from(n: NetworkNotification) -> Self {
        Notification::Network(n)
    }
}

impl PartyNotification {
    fn parse(payload: &str) -> PartyResult<Option<Self>> {
        let args: Vec<&str> = payload.split_whitespace().collect();
        let Some(command) = args.first() else {
            return Err(malformed(payload, "empty payload"));
        };

        let notification = match command.to_ascii_lowercase().as_str() {
            "disband" => {
                expect_arity(payload, &args, 2)?;
                PartyNotification::Disband { party_id: party_id(payload, args[1])? }
            }
            "join" => {
                expect_arity(payload, &args, 3)?;
                PartyNotification::Join {
                    party_id: party_id(payload, args[1])?,
                    player_id: player_id(payload, args[2])?,
                }
            }
            "leave" => {
                expect_arity(payload, &args, 3)?;
                PartyNotification::Leave {
                    party_id: party_id(payload, args[1])?,
                    player_id: player_id(payload, args[2])?,
                }
            }
            "update" => {
                expect_arity(payload, &args, 2)?;
                PartyNotification::Update { party_id: party_id(payload, args[1])? }
            }
            "updateplayer" => {
                expect_arity(payload, &args, 2)?;
                PartyNotification::UpdatePlayer { player_id: player_id(payload, args[1])? }
            }
            _ => return Ok(None),
        };
        Ok(Some(notification))
    }
}

impl NetworkNotification {
    fn parse(payload: &str) -> PartyResult<Option<Self>> {
        // message text keeps its inner spacing, so split at most three ways
        let mut parts = payload.trim_start().splitn(3, ' ');
        let command = parts.next().unwrap_or_default().to_ascii_lowercase();
        let targets = parts.next();
        let rest = parts.next();

        match command.as_str() {
            "message" => {
                let (Some(targets), Some(text)) = (targets, rest) else {
                    return Err(malformed(payload, "message needs targets and text"));
                };
                Ok(Some(NetworkNotification::Message {
                    players: player_list(payload, targets)?,
                    text: text.to_string(),
                }))
            }
            "connect" => {
                let (Some(targets), Some(server)) = (targets, rest) else {
                    return Err(malformed(payload, "connect needs targets and server"));
                };
                let server = server.trim();
                if server.is_empty() || server.contains(' ') {
                    return Err(malformed(payload, "connect takes exactly one server name"));
                }
                Ok(Some(NetworkNotification::Connect {
                    players: player_list(payload, targets)?,
                    server: server.to_string(),
                }))
            }
            "" => Err(malformed(payload, "empty payload")),
            _ => Ok(None),
        }
    }
}

impl fmt::Display for PartyNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartyNotification::Disband { party_id } => write!(f, "disband {}", party_id),
            PartyNotification::Join { party_id, player_id } => write!(f, "join {} {}", party_id, player_id),
            PartyNotification::Leave { party_id, player_id } => write!(f, "leave {} {}", party_id, player_id),
            PartyNotification::Update { party_id } => write!(f, "update {}", party_id),
            PartyNotification::UpdatePlayer { player_id } => write!(f, "updateplayer {}", player_id),
        }
    }
}

impl fmt::Display for NetworkNotification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkNotification::Message { players, text } => write!(f, "message {} {}", join_players(players), text),
            NetworkNotification::Connect { players, server } => write!(f, "connect {} {}", join_players(players), server),
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::Party(n) => n.fmt(f),
            Notification::Network(n) => n.fmt(f),
        }
    }
}

fn join_players(players: &[PlayerId]) -> String {
    players.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",")
}

fn expect_arity(payload: &str, args: &[&str], expected: usize) -> PartyResult<()> {
    if args.len() != expected {
        return Err(malformed(payload, &format!("expected {} tokens, got {}", expected, args.len())));
    }
    Ok(())
}

fn party_id(payload: &str, raw: &str) -> PartyResult<PartyId> {
    raw.parse::<PartyId>().map_err(|e| malformed(payload, &e))
}

fn player_id(payload: &str, raw: &str) -> PartyResult<PlayerId> {
    raw.parse::<PlayerId>()
        .map_err(|e| malformed(payload, &format!("bad player id '{}': {}", raw, e)))
}

fn player_list(payload: &str, raw: &str) -> PartyResult<Vec<PlayerId>> {
    raw.split(',').filter(|s| !s.is_empty()).map(|s| player_id(payload, s)).collect()
}

fn malformed(payload: &str, reason: &str) -> PartyError {
    PartyError::MalformedMessage(format!("'{}': {}", payload, reason))
}
