use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub logging: LoggingConfig,
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    pub connect_timeout_seconds: u64,
    pub operation_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "capstream:".to_string(),
            connect_timeout_seconds: 5,
            operation_timeout_seconds: 5,
        }
    }
}

impl RedisConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Which implementation backs a collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Redis,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub collection: String,
    pub capacity_bytes: u64,
    pub max_count: u64,
    pub tail_block_ms: u64,
    pub tail_batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Redis,
            collection: "persons".to_string(),
            capacity_bytes: 10 * 1024 * 1024,
            max_count: 1000,
            tail_block_ms: 1000,
            tail_batch_size: 100,
        }
    }
}

/// Where a consumer group starts reading when it does not exist yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub backend: Backend,
    pub topic: String,
    pub group: String,
    pub offset_reset: OffsetReset,
    pub topic_max_len: usize,
    pub publish_timeout_ms: u64,
    pub read_block_ms: u64,
    pub read_batch_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Redis,
            topic: "person-events".to_string(),
            group: "person-websocket-group".to_string(),
            offset_reset: OffsetReset::Earliest,
            topic_max_len: 10_000,
            publish_timeout_ms: 5000,
            read_block_ms: 1000,
            read_batch_size: 100,
        }
    }
}

impl BrokerConfig {
    #[must_use]
    pub const fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

/// Circuit breaker settings. A `failure_threshold` of 0 disables the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub min_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_backoff_seconds: 10,
            max_backoff_seconds: 60,
        }
    }
}

impl BreakerPolicy {
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            failure_threshold: 0,
            min_backoff_seconds: 1,
            max_backoff_seconds: 1,
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.failure_threshold > 0
    }
}

/// Reconnect schedule for long-lived subscriptions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f32,
    pub jitter: bool,
    pub breaker: BreakerPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay_ms: 1000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: true,
            breaker: BreakerPolicy::default(),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub destination: String,
    pub publish_queue_capacity: usize,
    pub subscriber_buffer: usize,
    pub reconnect: RetryPolicy,
    pub publish_breaker: BreakerPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            destination: "/topic/persons/live".to_string(),
            publish_queue_capacity: 1024,
            subscriber_buffer: 256,
            reconnect: RetryPolicy::default(),
            publish_breaker: BreakerPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CAPSTREAM__STORE__MAX_COUNT=500 etc.
        builder = builder.add_source(
            Environment::with_prefix("CAPSTREAM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Get HTTP address
    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }

    /// Check the configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.store.collection.trim().is_empty() {
            errors.push("store.collection must not be empty".to_string());
        }
        if self.store.capacity_bytes == 0 {
            errors.push("store.capacity_bytes must be greater than zero".to_string());
        }
        if self.store.max_count == 0 {
            errors.push("store.max_count must be greater than zero".to_string());
        }
        if self.store.backend == Backend::Memory {
            errors.push(
                "store.backend = memory has no external writer; use redis outside of tests".to_string(),
            );
        }
        if self.store.tail_batch_size == 0 {
            errors.push("store.tail_batch_size must be greater than zero".to_string());
        }
        if self.broker.topic.trim().is_empty() {
            errors.push("broker.topic must not be empty".to_string());
        }
        if self.broker.group.trim().is_empty() {
            errors.push("broker.group must not be empty".to_string());
        }
        if self.broker.read_batch_size == 0 {
            errors.push("broker.read_batch_size must be greater than zero".to_string());
        }
        if self.pipeline.destination.trim().is_empty() {
            errors.push("pipeline.destination must not be empty".to_string());
        }
        if self.pipeline.publish_queue_capacity == 0 {
            errors.push("pipeline.publish_queue_capacity must be greater than zero".to_string());
        }
        if self.pipeline.subscriber_buffer == 0 {
            errors.push("pipeline.subscriber_buffer must be greater than zero".to_string());
        }
        let reconnect = &self.pipeline.reconnect;
        if reconnect.min_delay_ms > reconnect.max_delay_ms {
            errors.push(format!(
                "pipeline.reconnect.min_delay_ms ({}) exceeds max_delay_ms ({})",
                reconnect.min_delay_ms, reconnect.max_delay_ms
            ));
        }
        if reconnect.factor < 1.0 {
            errors.push("pipeline.reconnect.factor must be at least 1.0".to_string());
        }
        for (name, breaker) in [
            ("pipeline.reconnect.breaker", &reconnect.breaker),
            ("pipeline.publish_breaker", &self.pipeline.publish_breaker),
        ] {
            if breaker.is_enabled() && breaker.min_backoff_seconds > breaker.max_backoff_seconds {
                errors.push(format!(
                    "{name}.min_backoff_seconds exceeds max_backoff_seconds"
                ));
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.store.collection, "persons");
        assert_eq!(config.store.capacity_bytes, 10 * 1024 * 1024);
        assert_eq!(config.store.max_count, 1000);
        assert_eq!(config.broker.topic, "person-events");
        assert_eq!(config.pipeline.destination, "/topic/persons/live");
        assert_eq!(config.pipeline.reconnect.min_delay(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_http_address() {
        let config = Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                http_port: 9090,
            },
            ..Config::default()
        };

        assert_eq!(config.http_address(), "127.0.0.1:9090");
    }

    #[test]
    fn test_validate_collects_every_error() {
        let mut config = Config::default();
        config.store.max_count = 0;
        config.broker.topic = String::new();
        config.pipeline.reconnect.min_delay_ms = 60_000;
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("max_count")));
        assert!(errors.iter().any(|e| e.contains("broker.topic")));
        assert!(errors.iter().any(|e| e.contains("min_delay_ms")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }

    #[test]
    fn test_memory_store_backend_is_rejected() {
        let mut config = Config::default();
        config.store.backend = Backend::Memory;
        config.broker.backend = Backend::Memory;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("store.backend"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "store:\n  collection: people\n  max_count: 50\nbroker:\n  backend: memory\n  offset_reset: latest\npipeline:\n  reconnect:\n    jitter: false\n"
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.store.collection, "people");
        assert_eq!(config.store.max_count, 50);
        assert_eq!(config.store.capacity_bytes, 10 * 1024 * 1024);
        assert_eq!(config.broker.backend, Backend::Memory);
        assert_eq!(config.broker.offset_reset, OffsetReset::Latest);
        assert!(!config.pipeline.reconnect.jitter);
        assert_eq!(config.pipeline.reconnect.max_delay_ms, 30_000);
    }
}
