// party_sync/server/src/network/mod.rs
pub mod presence;
