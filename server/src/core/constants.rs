// party_sync/server/src/core/constants.rs

// Pub/sub channels
pub const PARTY_CHANNEL: &str = "party";
pub const NETWORK_CHANNEL: &str = "jadedparty";
pub const SUBSCRIBED_CHANNELS: [&str; 2] = [PARTY_CHANNEL, NETWORK_CHANNEL];

// Backend key namespace
pub const PARTY_KEY_PREFIX: &str = "parties:";
pub const PLAYER_KEY_PREFIX: &str = "players:";

// Party id generation
pub const DEFAULT_PARTY_ID_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const DEFAULT_PARTY_ID_MIN_LENGTH: usize = 10;
pub const DEFAULT_PARTY_ID_MAX_LENGTH: usize = 12;
pub const MAX_PARTY_ID_ATTEMPTS: usize = 64;

// Presence timings
pub const DEFAULT_DISCONNECT_GRACE_MS: u64 = 250; // five 50ms ticks
pub const DEFAULT_NEW_PARTY_INVITE_DELAY_MS: u64 = 500;

// Redis
pub const DEFAULT_REDIS_PORT: u16 = 6379;
pub const DEFAULT_REDIS_MAX_IDLE_CONNECTIONS: usize = 8;
pub const DEFAULT_REDIS_RECONNECT_DELAY_MS: u64 = 2_000;
pub const DEFAULT_REDIS_READ_TIMEOUT_MS: u64 = 1_000;

// Metrics
pub const DEFAULT_METRICS_PORT: u16 = 9090;
