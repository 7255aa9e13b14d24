//! Scheduler stage binary

use anyhow::Context;
use ios_core::config::load_settings;
use ios_core::logging::init_tracing;
use ios_core::{BusClient, CorrelationStore, MqttBus};
use ios_scheduler::{assemble, SchedulerSettings, CONFIG_ENV, ENV_PREFIX, SERVICE_NAME};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .or_else(|| std::env::var_os(CONFIG_ENV))
        .map(PathBuf::from);

    let settings: SchedulerSettings =
        load_settings(config_path.as_deref(), ENV_PREFIX).context("Failed to load scheduler settings")?;
    init_tracing(&settings.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        broker = %settings.bus.broker,
        port = settings.bus.port,
        "Starting {SERVICE_NAME}"
    );

    let bus: Arc<dyn BusClient> = Arc::new(MqttBus::new(settings.bus.clone(), SERVICE_NAME));
    let mut supervisor = assemble(settings, bus, CorrelationStore::new())?;

    if let Err(e) = supervisor.run_until_shutdown().await {
        error!(error = %e, "Scheduler terminated with an error");
        return Err(e.into());
    }
    info!("Scheduler shut down gracefully");
    Ok(())
}
