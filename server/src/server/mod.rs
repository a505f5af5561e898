// party_sync/server/src/server/mod.rs
pub mod context;
pub mod instance;
pub mod manager;
pub mod processor;
