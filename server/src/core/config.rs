// party_sync/server/src/core/config.rs
use super::constants::*;
use super::error::{PartyError, PartyResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    /// In-process map. Standalone deployments only.
    #[default]
    Memory,
    /// Shared Redis store, required for cross-server parties.
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: i64,
    pub max_idle_connections: usize,
    pub reconnect_delay_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_REDIS_PORT,
            username: None,
            password: None,
            database: 0,
            max_idle_connections: DEFAULT_REDIS_MAX_IDLE_CONNECTIONS,
            reconnect_delay_ms: DEFAULT_REDIS_RECONNECT_DELAY_MS,
            read_timeout_ms: DEFAULT_REDIS_READ_TIMEOUT_MS,
        }
    }
}

impl RedisConfig {
    pub fn connection_url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{}:{}@", user, pass),
            (None, Some(pass)) => format!(":{}@", pass),
            (Some(user), None) => format!("{}@", user),
            (None, None) => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.database)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "type")]
    pub kind: CacheType,
    pub redis: RedisConfig,
    /// Optional key namespace, e.g. `jadedparty` gives `jadedparty:parties:{id}`.
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartyIdSettings {
    pub alphabet: String,
    pub min_length: usize,
    pub max_length: usize,
    pub prefix: String,
}

impl Default for PartyIdSettings {
    fn default() -> Self {
        PartyIdSettings {
            alphabet: DEFAULT_PARTY_ID_ALPHABET.to_string(),
            min_length: DEFAULT_PARTY_ID_MIN_LENGTH,
            max_length: DEFAULT_PARTY_ID_MAX_LENGTH,
            prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlayerSettings {
    /// Display prefix given to newly created party players.
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPoolConfig {
    pub io_threads: usize,
    pub message_threads: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        let cores = num_cpus::get().max(2);
        TaskPoolConfig {
            io_threads: cores,
            message_threads: (cores / 2).max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            port: DEFAULT_METRICS_PORT,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartyConfig {
    pub cache: CacheConfig,
    pub party_id: PartyIdSettings,
    pub player: PlayerSettings,
    /// This process is the whole network: a disconnect is a departure.
    pub standalone: bool,
    pub debug_mode: bool,
    pub disconnect_grace_ms: u64,
    pub new_party_invite_delay_ms: u64,
    pub task_pools: TaskPoolConfig,
    pub metrics: MetricsConfig,
}

impl Default for PartyConfig {
    fn default() -> Self {
        PartyConfig {
            cache: CacheConfig::default(),
            party_id: PartyIdSettings::default(),
            player: PlayerSettings::default(),
            standalone: true,
            debug_mode: false,
            disconnect_grace_ms: DEFAULT_DISCONNECT_GRACE_MS,
            new_party_invite_delay_ms: DEFAULT_NEW_PARTY_INVITE_DELAY_MS,
            task_pools: TaskPoolConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl PartyConfig {
    pub fn from_yaml_str(yaml: &str) -> PartyResult<Self> {
        let config: PartyConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> PartyResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn validate(&self) -> PartyResult<()> {
        let ids = &self.party_id;
        if ids.alphabet.is_empty() {
            return Err(PartyError::ConfigError("party_id.alphabet must not be empty".into()));
        }
        if ids.alphabet.chars().any(char::is_whitespace) {
            return Err(PartyError::ConfigError("party_id.alphabet must not contain whitespace".into()));
        }
        if ids.prefix.chars().any(char::is_whitespace) {
            return Err(PartyError::ConfigError("party_id.prefix must not contain whitespace".into()));
        }
        if ids.min_length == 0 || ids.min_length > ids.max_length {
            return Err(PartyError::ConfigError(format!(
                "party_id length range {}..={} is invalid",
                ids.min_length, ids.max_length
            )));
        }
        if self.task_pools.io_threads == 0 || self.task_pools.message_threads == 0 {
            return Err(PartyError::ConfigError("task pools need at least one thread".into()));
        }
        Ok(())
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn new_party_invite_delay(&self) -> Duration {
        Duration::from_millis(self.new_party_invite_delay_ms)
    }
}
