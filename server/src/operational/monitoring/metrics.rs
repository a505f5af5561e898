// party_sync/server/src/operational/monitoring/metrics.rs
use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use anyhow::{Context, Result};

/// Installs the Prometheus exporter and describes every metric. Without it
/// the recording helpers below are no-ops.
pub fn install_exporter(port: u16) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus exporter")?;

    describe_counter!("party_notifications_published_total", "Notifications published, by channel");
    describe_counter!("party_notifications_received_total", "Notifications received, by channel");
    describe_counter!("party_notifications_dropped_total", "Notifications dropped as malformed");
    describe_counter!("party_backend_errors_total", "Failed backend operations, by operation");
    describe_gauge!("party_local_parties", "Parties mirrored by this process");
    Ok(())
}

pub fn record_published(channel: &str) {
    counter!("party_notifications_published_total", "channel" => channel.to_string()).increment(1);
}

pub fn record_received(channel: &str) {
    counter!("party_notifications_received_total", "channel" => channel.to_string()).increment(1);
}

pub fn record_dropped() {
    counter!("party_notifications_dropped_total").increment(1);
}

pub fn record_backend_error(operation: &str) {
    counter!("party_backend_errors_total", "operation" => operation.to_string()).increment(1);
}

pub fn set_local_parties(count: usize) {
    gauge!("party_local_parties").set(count as f64);
}

// Logging setup
pub fn init_logging(debug_mode: bool) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_filter = if debug_mode {
        "party_sync_core=debug,warn"
    } else {
        "party_sync_core=info,warn"
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer())
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
