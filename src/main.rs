//! Market data relay
//!
//! # Architecture
//! - **core**: Catalog, instruments, option chains, tick model
//! - **hot_path**: Latency-critical code (codec, frame filter, price cache, Greeks)
//! - **ws**: Upstream feed client
//! - **hub**: Downstream fan-out
//! - **infrastructure**: Cold path (logging, metrics, config, api)

use anyhow::Context;
use tick_relay::engine::RelayEngine;
use tick_relay::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guards = tick_relay::infrastructure::logging::init_logging()
        .context("Failed to initialize logging")?;

    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(
        underlyings = config.underlyings.len(),
        port = config.api.port,
        "Starting tick relay"
    );

    let engine = RelayEngine::new(config)?;
    engine.run().await?;

    tracing::info!("Tick relay stopped");
    Ok(())
}
