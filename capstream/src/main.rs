mod bootstrap;
mod server;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use capstream_core::logging;
use capstream_pipeline::{Pipeline, PipelineSettings, SubscriberRegistry};

use bootstrap::{generate_node_id, init_broker, init_store, load_config};
use server::AppState;

/// How long stages get to wind down after the HTTP server stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Capstream starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Connect the bounded store and the broker
    let node_id = generate_node_id();
    info!(node_id = %node_id, "Node identity assigned");
    let store = init_store(&config).await?;
    let broker = init_broker(&config, node_id).await?;

    // 4. Subscriber registry shared by the router and the WebSocket endpoint
    let registry = SubscriberRegistry::new(config.pipeline.subscriber_buffer);

    // 5. Start the pipeline; fails fast when the store cannot be bounded
    let pipeline = Pipeline::start(
        PipelineSettings::from_config(&config),
        store,
        broker,
        Arc::new(registry.clone()),
    )
    .await
    .context("Failed to start pipeline")?;

    // 6. Serve HTTP until a shutdown signal
    let state = AppState {
        registry,
        reader_status: pipeline.reader_status(),
        destination: config.pipeline.destination.clone(),
    };
    let served = server::serve(&config.http_address(), state).await;

    // 7. Stop the pipeline
    if !pipeline.shutdown(SHUTDOWN_GRACE).await {
        warn!("Pipeline did not stop within the grace period");
    }
    served?;

    info!("Capstream stopped");
    Ok(())
}
