// party_sync/server/src/server/context.rs
use crate::cache::message::Notification;
use crate::cache::snapshot::Snapshot;
use crate::cache::{publish_notification, Cache, Keyspace};
use crate::concurrent::task_pool::TaskPoolSystem;
use crate::core::error::PartyResult;
use std::sync::Arc;

/// Everything an entity needs to persist or announce itself: the backend,
/// its key layout and the pools that must run the I/O. Cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
    pub cache: Arc<dyn Cache>,
    pub keyspace: Keyspace,
    pub tasks: Arc<TaskPoolSystem>,
}

impl SyncContext {
    pub fn new(cache: Arc<dyn Cache>, keyspace: Keyspace, tasks: Arc<TaskPoolSystem>) -> Self {
        SyncContext { cache, keyspace, tasks }
    }

    pub fn store(&self, key: &str, snapshot: &Snapshot) -> PartyResult<()> {
        self.cache.set(key, snapshot)
    }

    pub fn publish(&self, notification: &Notification) -> PartyResult<()> {
        publish_notification(self.cache.as_ref(), notification)
    }
}
