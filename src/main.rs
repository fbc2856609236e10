use anyhow::Result;
use tracing::{info, warn};

use ocpp_gateway::config::AppConfig;
use ocpp_gateway::telemetry::{init_tracing, shutdown_signal};
use ocpp_gateway::Gateway;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load()?;
    info!(csms = %config.csms.url, devices = config.devices.len(), "starting OCPP gateway");

    let gateway = Gateway::new(config)?;
    gateway.start().await?;

    shutdown_signal().await;

    gateway.stop().await;
    warn!("shutdown complete");
    Ok(())
}
