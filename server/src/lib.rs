// party_sync/server/src/lib.rs

pub mod cache;
pub mod concurrent;
pub mod core;
pub mod entities;
pub mod network;
pub mod operational;
pub mod server;

pub use crate::core::config::PartyConfig;
pub use crate::core::error::{PartyError, PartyResult};
pub use crate::server::instance::PartySyncService;
