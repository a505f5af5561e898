// party_sync/server/src/main.rs
use party_sync_core::core::config::PartyConfig;
use party_sync_core::network::presence::{LocalPresence, PresenceEvent};
use party_sync_core::operational::monitoring::metrics;
use party_sync_core::server::instance::PartySyncService;

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const EVENT_DRAIN_INTERVAL: Duration = Duration::from_millis(50);
const EVENT_DRAIN_BATCH: usize = 256;

fn load_config() -> anyhow::Result<PartyConfig> {
    match std::env::args().nth(1) {
        Some(path) => PartyConfig::load(&path).with_context(|| format!("Failed to load config from {}", path)),
        None => Ok(PartyConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    if let Err(e) = metrics::init_logging(config.debug_mode) {
        eprintln!("Failed to initialize logging: {:?}", e);
        return Err(e);
    }
    info!("Party sync node starting up...");

    if config.metrics.enabled {
        metrics::install_exporter(config.metrics.port)?;
        info!("Metrics exported on 0.0.0.0:{}", config.metrics.port);
    }

    let presence = Arc::new(LocalPresence::new());
    let service = match PartySyncService::new(config, presence.clone()) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            error!("Failed to start party sync: {}", e);
            return Err(anyhow::anyhow!("Party sync initialization failed: {}", e));
        }
    };
    info!(
        "Party sync node running ({:?} backend). Press Ctrl-C to stop.",
        service.config().cache.kind
    );

    // Without a game host attached, deliveries are only logged.
    let mut ticker = tokio::time::interval(EVENT_DRAIN_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for event in presence.drain_events(EVENT_DRAIN_BATCH) {
                    match event {
                        PresenceEvent::Message { player_id, text } => info!("[MESSAGE -> {}] {}", player_id, text),
                        PresenceEvent::Transfer { player_id, server } => info!("[CONNECT {} -> {}]", player_id, server),
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!(
        "Party sync node shut down ({} local parties, {} local players).",
        service.manager().local_party_count(),
        service.manager().local_player_count()
    );
    Ok(())
}
