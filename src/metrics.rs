//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // Gateway Metrics
    pub static ref GATEWAY_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_gateway_requests_total", "Total number of remote gateway requests"),
        &["operation", "collection", "outcome"]
    ).expect("metric can be created");
    pub static ref GATEWAY_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "tidepool_gateway_request_duration_seconds",
            "Remote gateway request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["operation", "collection"]
    ).expect("metric can be created");

    // Cache Metrics
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_cache_hits_total", "Total number of cache hits"),
        &["collection", "freshness"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_cache_misses_total", "Total number of cache misses"),
        &["collection"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tidepool_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_INVALIDATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_cache_invalidations_total", "Total number of cache invalidations"),
        &["collection", "scope"]
    ).expect("metric can be created");

    // Mutation Metrics
    pub static ref MUTATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_mutations_total", "Total number of mutations performed"),
        &["mutation", "outcome"]
    ).expect("metric can be created");
    pub static ref ROLLBACKS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_rollbacks_total", "Total number of optimistic rollbacks"),
        &["mutation"]
    ).expect("metric can be created");

    // Realtime Metrics
    pub static ref REALTIME_EVENTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_realtime_events_total", "Total number of realtime change events received"),
        &["collection", "kind"]
    ).expect("metric can be created");
    pub static ref SUBSCRIPTIONS_ACTIVE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("tidepool_subscriptions_active", "Current number of active realtime subscriptions"),
        &["collection"]
    ).expect("metric can be created");

    // Blob Metrics
    pub static ref BLOB_UPLOADS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_blob_uploads_total", "Total number of blob uploads"),
        &["bucket", "outcome"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("tidepool_errors_total", "Total number of errors"),
        &["error_type"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(GATEWAY_REQUESTS_TOTAL.clone()))
        .expect("GATEWAY_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(GATEWAY_REQUEST_DURATION_SECONDS.clone()))
        .expect("GATEWAY_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_SIZE.clone()))
        .expect("CACHE_SIZE can be registered");
    REGISTRY
        .register(Box::new(CACHE_INVALIDATIONS_TOTAL.clone()))
        .expect("CACHE_INVALIDATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(MUTATIONS_TOTAL.clone()))
        .expect("MUTATIONS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ROLLBACKS_TOTAL.clone()))
        .expect("ROLLBACKS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(REALTIME_EVENTS_TOTAL.clone()))
        .expect("REALTIME_EVENTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(SUBSCRIPTIONS_ACTIVE.clone()))
        .expect("SUBSCRIPTIONS_ACTIVE can be registered");
    REGISTRY
        .register(Box::new(BLOB_UPLOADS_TOTAL.clone()))
        .expect("BLOB_UPLOADS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");
}
