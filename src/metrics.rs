//! # Metrics
//!
//! Prometheus metrics for monitoring the provider.
//!
//! ## Metrics Exposed
//!
//! - `credentials_provider_snapshots_total` - Total number of full snapshot loads
//! - `credentials_provider_resyncs_total` - Total number of resyncs triggered by expired resume points
//! - `credentials_provider_watch_events_total` - Total number of watch events, labelled by kind
//! - `credentials_provider_conversion_failures_total` - Total number of secrets skipped due to conversion failures
//! - `credentials_provider_credentials_cached` - Current number of cached credentials

use anyhow::Result;
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::LazyLock;

pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static SNAPSHOTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "credentials_provider_snapshots_total",
        "Total number of full snapshot loads",
    )
    .expect("Failed to create SNAPSHOTS_TOTAL metric - this should never happen")
});

static RESYNCS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "credentials_provider_resyncs_total",
        "Total number of resyncs triggered by expired resume points",
    )
    .expect("Failed to create RESYNCS_TOTAL metric - this should never happen")
});

static WATCH_EVENTS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "credentials_provider_watch_events_total",
            "Total number of watch events received, labelled by kind",
        ),
        &["kind"],
    )
    .expect("Failed to create WATCH_EVENTS_TOTAL metric - this should never happen")
});

static CONVERSION_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "credentials_provider_conversion_failures_total",
        "Total number of secrets skipped due to conversion failures",
    )
    .expect("Failed to create CONVERSION_FAILURES_TOTAL metric - this should never happen")
});

static CREDENTIALS_CACHED: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "credentials_provider_credentials_cached",
        "Current number of cached credentials",
    )
    .expect("Failed to create CREDENTIALS_CACHED metric - this should never happen")
});

/// Registers all metrics with the crate registry. Call once at startup.
pub fn register_metrics() -> Result<()> {
    REGISTRY.register(Box::new(SNAPSHOTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(RESYNCS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WATCH_EVENTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CONVERSION_FAILURES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(CREDENTIALS_CACHED.clone()))?;
    Ok(())
}

pub fn increment_snapshots() {
    SNAPSHOTS_TOTAL.inc();
}

pub fn increment_resyncs() {
    RESYNCS_TOTAL.inc();
}

pub fn observe_watch_event(kind: &str) {
    WATCH_EVENTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_conversion_failures() {
    CONVERSION_FAILURES_TOTAL.inc();
}

pub fn set_credentials_cached(count: i64) {
    CREDENTIALS_CACHED.set(count);
}
