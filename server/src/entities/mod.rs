// party_sync/server/src/entities/mod.rs
pub mod party;
pub mod party_player;

pub use party::{Party, Promotion, Removal};
pub use party_player::PartyPlayer;
