//! Prometheus metrics for the router

use anyhow::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

/// Standard histogram buckets for resolution latency (in seconds)
pub const RESOLUTION_BUCKETS: &[f64] = &[
    0.000_001, 0.000_005, 0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05,
];

/// Metrics exported by the resolution and caching layer
pub struct RouterMetrics {
    registry: Registry,
    /// Resolutions by operation and outcome
    pub resolutions_total: IntCounterVec,
    pub resolution_duration: Histogram,
    /// Deliveries that moved past the first candidate, by operation
    pub fallbacks_total: IntCounterVec,
    /// Refresh attempts by outcome
    pub refreshes_total: IntCounterVec,
    pub table_version: IntGauge,
    pub table_entries: IntGauge,
    /// Numeric cache state (see `CacheState::as_metric`)
    pub cache_state: IntGauge,
}

impl RouterMetrics {
    pub fn new() -> Result<Self> {
        Self::with_component("router")
    }

    pub fn with_component(component: &str) -> Result<Self> {
        let registry = Registry::new();

        let resolutions_total = IntCounterVec::new(
            Opts::new("fedns_resolutions_total", "Path resolutions by operation and outcome")
                .const_label("component", component),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(resolutions_total.clone()))?;

        let resolution_duration = Histogram::with_opts(
            HistogramOpts::new("fedns_resolution_duration_seconds", "Time spent resolving a path")
                .const_label("component", component)
                .buckets(RESOLUTION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(resolution_duration.clone()))?;

        let fallbacks_total = IntCounterVec::new(
            Opts::new("fedns_fallbacks_total", "Deliveries that fell back to a later destination")
                .const_label("component", component),
            &["operation"],
        )?;
        registry.register(Box::new(fallbacks_total.clone()))?;

        let refreshes_total = IntCounterVec::new(
            Opts::new("fedns_mount_table_refreshes_total", "Mount table refreshes by outcome")
                .const_label("component", component),
            &["outcome"],
        )?;
        registry.register(Box::new(refreshes_total.clone()))?;

        let table_version = IntGauge::with_opts(
            Opts::new("fedns_mount_table_version", "Version of the active mount table")
                .const_label("component", component),
        )?;
        registry.register(Box::new(table_version.clone()))?;

        let table_entries = IntGauge::with_opts(
            Opts::new("fedns_mount_table_entries", "Entries in the active mount table")
                .const_label("component", component),
        )?;
        registry.register(Box::new(table_entries.clone()))?;

        let cache_state = IntGauge::with_opts(
            Opts::new("fedns_mount_table_cache_state", "Mount table cache lifecycle state")
                .const_label("component", component),
        )?;
        registry.register(Box::new(cache_state.clone()))?;

        Ok(Self {
            registry,
            resolutions_total,
            resolution_duration,
            fallbacks_total,
            refreshes_total,
            table_version,
            table_entries,
            cache_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
