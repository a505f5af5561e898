// party_sync/server/src/concurrent/mod.rs
pub mod task_pool;
