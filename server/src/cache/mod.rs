// party_sync/server/src/cache/mod.rs
pub mod memory;
pub mod message;
pub mod redis;
pub mod snapshot;

use crate::core::config::{CacheConfig, CacheType};
use crate::core::constants::{PARTY_KEY_PREFIX, PLAYER_KEY_PREFIX};
use crate::core::error::PartyResult;
use crate::core::types::{PartyId, PlayerId};
use crate::operational::monitoring::metrics;
use message::Notification;
use parking_lot::RwLock;
use snapshot::Snapshot;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

/// Receives every message published on the subscribed channels. Delivery is
/// at-least-once and unordered, so implementations must be idempotent.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, channel: &str, payload: &str);
}

/// Shared store plus broadcast. All calls may block on I/O; keep them off
/// latency-sensitive threads (see `concurrent::task_pool`).
///
/// `Ok(None)` / an empty scan mean "nothing stored". An unreachable backend is
/// always an `Err(PartyError::BackendUnavailable)`.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> PartyResult<Option<Snapshot>>;
    fn set(&self, key: &str, snapshot: &Snapshot) -> PartyResult<()>;
    fn delete(&self, key: &str) -> PartyResult<()>;
    /// Every snapshot whose key starts with `prefix`.
    fn scan(&self, prefix: &str) -> PartyResult<Vec<Snapshot>>;
    /// Fire-and-forget; the publisher may or may not receive its own message.
    fn publish(&self, channel: &str, message: &str) -> PartyResult<()>;
    /// Handlers are held weakly: the backend stops delivering to a handler
    /// once its owner drops the last `Arc`.
    fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> PartyResult<()>;
    fn cache_type(&self) -> CacheType;
}

/// Builds the `parties:{id}` / `players:{id}` keys, optionally namespaced.
#[derive(Debug, Clone, Default)]
pub struct Keyspace {
    namespace: Option<String>,
}

impl Keyspace {
    pub fn new(namespace: Option<String>) -> Self {
        Keyspace {
            namespace: namespace.filter(|ns| !ns.is_empty()),
        }
    }

    pub fn party_prefix(&self) -> String {
        self.with_namespace(PARTY_KEY_PREFIX)
    }

    pub fn player_prefix(&self) -> String {
        self.with_namespace(PLAYER_KEY_PREFIX)
    }

    pub fn party_key(&self, party_id: &PartyId) -> String {
        format!("{}{}", self.party_prefix(), party_id)
    }

    pub fn player_key(&self, player_id: &PlayerId) -> String {
        format!("{}{}", self.player_prefix(), player_id)
    }

    fn with_namespace(&self, prefix: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{}:{}", ns, prefix),
            None => prefix.to_string(),
        }
    }
}

/// Subscribers of one backend instance, held weakly.
#[derive(Default)]
pub struct HandlerSet {
    handlers: RwLock<Vec<Weak<dyn MessageHandler>>>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: &Arc<dyn MessageHandler>) {
        self.handlers.write().push(Arc::downgrade(handler));
    }

    /// Upgrades the live handlers and forgets the dropped ones. Handlers are
    /// called on the returned list, so one may subscribe more handlers.
    pub fn live(&self) -> Vec<Arc<dyn MessageHandler>> {
        let live: Vec<Arc<dyn MessageHandler>> = self.handlers.read().iter().filter_map(Weak::upgrade).collect();
        if live.len() != self.handlers.read().len() {
            self.handlers.write().retain(|handler| handler.strong_count() > 0);
        }
        live
    }

    pub fn dispatch(&self, channel: &str, payload: &str) {
        for handler in self.live() {
            handler.on_message(channel, payload);
        }
    }

    pub fn len(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn build_cache(config: &CacheConfig) -> PartyResult<Arc<dyn Cache>> {
    match config.kind {
        CacheType::Memory => Ok(Arc::new(MemoryCache::new())),
        CacheType::Redis => Ok(Arc::new(RedisCache::connect(config.redis.clone())?)),
    }
}

/// Encodes and publishes a notification, counting it.
pub fn publish_notification(cache: &dyn Cache, notification: &Notification) -> PartyResult<()> {
    let channel = notification.channel();
    let payload = notification.to_string();
    match cache.publish(channel, &payload) {
        Ok(()) => {
            debug!("[{:?} PUB] {} {}", cache.cache_type(), channel, payload);
            metrics::record_published(channel);
            Ok(())
        }
        Err(e) => {
            warn!("Failed to publish '{}' on '{}': {}", payload, channel, e);
            Err(e)
        }
    }
}
