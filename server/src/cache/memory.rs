// party_sync/server/src/cache/memory.rs
use super::snapshot::Snapshot;
use super::{Cache, HandlerSet, MessageHandler};
use crate::core::config::CacheType;
use crate::core::error::PartyResult;
use dashmap::DashMap;
use std::sync::Arc;

/// Single-process backend. Publishing only reaches handlers registered on
/// this instance, so it is only meant for standalone deployments.
pub struct MemoryCache {
    documents: DashMap<String, Snapshot>,
    handlers: HandlerSet,
}

impl MemoryCache {
    pub fn new() -> Self {
        MemoryCache {
            documents: DashMap::new(),
            handlers: HandlerSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> PartyResult<Option<Snapshot>> {
        Ok(self.documents.get(key).map(|entry| entry.value().clone()))
    }

    fn set(&self, key: &str, snapshot: &Snapshot) -> PartyResult<()> {
        self.documents.insert(key.to_string(), snapshot.clone());
        Ok(())
    }

    fn delete(&self, key: &str) -> PartyResult<()> {
        self.documents.remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> PartyResult<Vec<Snapshot>> {
        Ok(self
            .documents
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().clone())
            .collect())
    }

    fn publish(&self, channel: &str, message: &str) -> PartyResult<()> {
        self.handlers.dispatch(channel, message);
        Ok(())
    }

    fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> PartyResult<()> {
        self.handlers.add(&handler);
        Ok(())
    }

    fn cache_type(&self) -> CacheType {
        CacheType::Memory
    }
}
