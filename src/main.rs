//! ethpilot - connect to a network, report gas statistics and key status

use anyhow::Result;
use ethpilot::config::Settings;
use ethpilot::tx::BLOCK_TIP_PERCENTILE;
use ethpilot::{metrics, Client, TIMEOUT_KEY_NUM};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting ethpilot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(network = %settings.network.name, "Loaded configuration");

    let client = Client::new(settings).await?;

    let blocks = client.settings().network.gas_price_estimation_blocks.max(1);
    match client.stats(blocks, BLOCK_TIP_PERCENTILE).await {
        Ok(stats) => info!(
            blocks,
            base_fee_p50 = %stats.gas_price.p50,
            tip_p50 = %stats.tip_cap.p50,
            suggested_gas_price = %stats.suggested_gas_price,
            suggested_tip = %stats.suggested_gas_tip_cap,
            "Gas statistics"
        ),
        Err(e) => warn!(error = %e, "Failed to compute gas statistics"),
    }

    let estimations = client
        .calculate_gas_estimations(&client.new_default_gas_estimation_request())
        .await;
    info!(?estimations, "Gas estimations for the next transaction");

    if !client.keys().is_empty() {
        match client.any_synced_key().await {
            TIMEOUT_KEY_NUM => warn!("No synced key found"),
            key_num => info!(key_num, "Found synced key"),
        }
    }

    debug!("Metrics:\n{}", metrics::gather_text()?);

    client.shutdown();
    info!("ethpilot stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ethpilot=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}
