//! Prometheus metrics for the change-propagation pipeline
//!
//! Metrics are registered lazily on first use and exposed through
//! [`gather`] for the `/metrics` endpoint.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Records yielded by the change cursor
pub static RECORDS_READ: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "capstream_records_read_total",
        "Total number of records read from the bounded store cursor",
        REGISTRY.clone()
    )
    .expect("Failed to register RECORDS_READ")
});

/// Publish outcomes, labeled `ok`, `error` or `dropped`
pub static PUBLISH_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "capstream_publish_total",
        "Topic publish attempts by outcome",
        &["result"],
        REGISTRY.clone()
    )
    .expect("Failed to register PUBLISH_TOTAL")
});

/// Per-subscriber broadcast outcomes, labeled `delivered`, `dropped`, `removed` or `error`
pub static BROADCAST_TOTAL: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "capstream_broadcast_total",
        "Broadcast deliveries by outcome",
        &["result"],
        REGISTRY.clone()
    )
    .expect("Failed to register BROADCAST_TOTAL")
});

/// Cursor re-subscriptions after an error
pub static READER_RECONNECTS: std::sync::LazyLock<IntCounter> = std::sync::LazyLock::new(|| {
    register_int_counter_with_registry!(
        "capstream_reader_reconnects_total",
        "Total number of change cursor reconnects",
        REGISTRY.clone()
    )
    .expect("Failed to register READER_RECONNECTS")
});

/// Current reader state as a number (see `ReaderState::as_gauge`)
pub static READER_STATE: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "capstream_reader_state",
        "Current change cursor reader state",
        REGISTRY.clone()
    )
    .expect("Failed to register READER_STATE")
});

/// Live subscriber connections across all destinations
pub static SUBSCRIBERS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "capstream_subscribers",
        "Current number of live subscriber connections",
        REGISTRY.clone()
    )
    .expect("Failed to register SUBSCRIBERS")
});

/// Render every registered metric in the Prometheus text format
pub fn gather() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_touched_metrics() {
        RECORDS_READ.inc();
        PUBLISH_TOTAL.with_label_values(&["ok"]).inc();

        let text = gather().unwrap();
        assert!(text.contains("capstream_records_read_total"));
        assert!(text.contains("capstream_publish_total{result=\"ok\"}"));
    }
}
