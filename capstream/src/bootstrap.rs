//! Configuration loading and collaborator wiring

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use capstream_core::broker::{Broker, MemoryBroker, RedisStreamBroker};
use capstream_core::config::Backend;
use capstream_core::store::{BoundedStore, RedisStreamStore};
use capstream_core::Config;

/// Load configuration from config file or environment variables
///
/// Config file search order:
/// 1. CAPSTREAM_CONFIG_PATH environment variable (explicit path)
/// 2. ./config.yaml (current working directory)
/// 3. /config/config.yaml (Kubernetes mount path)
/// 4. Fall back to environment variables only
pub fn load_config() -> Result<Config> {
    let config_path = std::env::var("CAPSTREAM_CONFIG_PATH")
        .ok()
        .filter(|p| std::path::Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| std::path::Path::new(p).exists())
                .map(str::to_string)
        });

    // Logging is not up yet, so report on stderr
    let config = if let Some(path) = config_path {
        eprintln!("Loading config from {path}");
        Config::from_file(&path).with_context(|| format!("Failed to load {path}"))?
    } else {
        eprintln!("No config file found, using environment variables");
        Config::from_env().context("Failed to load configuration from environment")?
    };

    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("Config validation error: {error}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

/// Unique identifier for this process, used as the broker consumer name
pub fn generate_node_id() -> String {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{hostname}-{}", nanoid::nanoid!(6))
}

/// Connect the bounded store. Only Redis is reachable by external writers;
/// `load_config` has already rejected the in-memory backend.
pub async fn init_store(config: &Config) -> Result<Arc<dyn BoundedStore>> {
    let store = RedisStreamStore::connect(&config.redis, &config.store)
        .await
        .context("Failed to connect bounded store to Redis")?;
    info!(collection = %config.store.collection, "Using Redis bounded store");
    Ok(Arc::new(store))
}

pub async fn init_broker(config: &Config, node_id: String) -> Result<Arc<dyn Broker>> {
    match config.broker.backend {
        Backend::Redis => {
            let broker = RedisStreamBroker::connect(&config.redis, &config.broker, node_id)
                .await
                .context("Failed to connect broker to Redis")?;
            info!(topic = %config.broker.topic, "Using Redis Streams broker");
            Ok(Arc::new(broker))
        }
        Backend::Memory => {
            warn!(
                topic = %config.broker.topic,
                "Using in-memory broker; messages are not shared with other processes"
            );
            Ok(Arc::new(MemoryBroker::new(
                config.broker.topic_max_len,
                config.broker.offset_reset,
            )))
        }
    }
}
