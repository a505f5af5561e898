// party_sync/server/src/operational/monitoring/mod.rs
pub mod metrics;
