//! Prometheus-based metrics module
//!
//! Tunnel lifecycle and relay counters. The Reactor updates them; the stats
//! reporter dumps them through [`gather_text`].

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Tunnel Metrics ===

    /// Tunnels created per kind
    pub static ref TUNNELS_CREATED: IntCounterVec = IntCounterVec::new(
        Opts::new("tunnelcore_tunnels_created_total", "Total tunnels registered with the reactor"),
        &["kind"]
    ).unwrap();

    /// Tunnels currently registered
    pub static ref TUNNELS_ACTIVE: IntGauge = IntGauge::new(
        "tunnelcore_tunnels_active",
        "Number of tunnels currently owned by the reactor"
    ).unwrap();

    /// Tunnels terminated by an error, per error kind
    pub static ref TUNNELS_FAILED: IntCounterVec = IntCounterVec::new(
        Opts::new("tunnelcore_tunnels_failed_total", "Tunnels closed by an error"),
        &["error"]
    ).unwrap();

    /// Connection attempts rejected before a tunnel existed
    pub static ref ROUTE_DECISION_ERRORS: IntCounter = IntCounter::new(
        "tunnelcore_route_decision_errors_total",
        "Connection attempts without a usable routing decision"
    ).unwrap();

    // === Traffic Metrics ===

    /// Bytes relayed per direction
    pub static ref RELAY_BYTES: IntCounterVec = IntCounterVec::new(
        Opts::new("tunnelcore_relay_bytes_total", "Bytes delivered per direction"),
        &["direction"]
    ).unwrap();

    /// Times a tunnel side had its reads suspended by backpressure
    pub static ref BACKPRESSURE_PAUSES: IntCounter = IntCounter::new(
        "tunnelcore_backpressure_pauses_total",
        "Read suspensions caused by a full pending buffer"
    ).unwrap();

    // === Tunnel Duration ===

    /// Tunnel lifetime histogram
    pub static ref TUNNEL_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "tunnelcore_tunnel_duration_seconds",
            "Tunnel lifetime in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["kind"]
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(TUNNELS_CREATED.clone())).ok();
    REGISTRY.register(Box::new(TUNNELS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(TUNNELS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(ROUTE_DECISION_ERRORS.clone())).ok();

    REGISTRY.register(Box::new(RELAY_BYTES.clone())).ok();
    REGISTRY.register(Box::new(BACKPRESSURE_PAUSES.clone())).ok();

    REGISTRY.register(Box::new(TUNNEL_DURATION_SECONDS.clone())).ok();
}

/// Render the registry in the Prometheus text format
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(500), "500 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }

    #[test]
    fn test_gather_after_init() {
        init_metrics();
        TUNNELS_CREATED.with_label_values(&["raw"]).inc_by(0);
        let text = gather_text();
        assert!(text.contains("tunnelcore_tunnels_active"));
    }
}
