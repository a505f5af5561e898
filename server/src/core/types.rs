// party_sync/server/src/core/types.rs
use crate::core::config::PartyIdSettings;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub type PlayerId = Uuid;

/// Short, randomly generated party identifier. Treated as opaque everywhere
/// except generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(String);

impl PartyId {
    /// Draws a fresh id: a length in `min_length..=max_length`, every character
    /// taken from the configured alphabet, with the optional prefix in front.
    pub fn generate(settings: &PartyIdSettings) -> Self {
        let alphabet: Vec<char> = settings.alphabet.chars().collect();
        let mut rng = rand::thread_rng();
        let length = rng.gen_range(settings.min_length..=settings.max_length.max(settings.min_length));

        let mut id = String::with_capacity(settings.prefix.len() + length);
        id.push_str(&settings.prefix);
        for _ in 0..length {
            id.push(alphabet[rng.gen_range(0..alphabet.len())]);
        }
        PartyId(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PartyId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Ids travel inside space-delimited notifications.
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(format!("invalid party id '{}'", s));
        }
        Ok(PartyId(s.to_string()))
    }
}

/// Party role, ordered by authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PartyRole {
    #[default]
    None,
    Member,
    Moderator,
    Leader,
}

impl PartyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartyRole::None => "NONE",
            PartyRole::Member => "MEMBER",
            PartyRole::Moderator => "MODERATOR",
            PartyRole::Leader => "LEADER",
        }
    }

    /// Whether the role may send invites.
    pub fn can_invite(&self) -> bool {
        *self >= PartyRole::Moderator
    }
}

impl fmt::Display for PartyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PartyRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NONE" => Ok(PartyRole::None),
            "MEMBER" => Ok(PartyRole::Member),
            "MODERATOR" => Ok(PartyRole::Moderator),
            "LEADER" => Ok(PartyRole::Leader),
            other => Err(format!("unknown party role '{}'", other)),
        }
    }
}
