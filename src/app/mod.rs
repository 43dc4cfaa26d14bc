//! Application Layer
//!
//! This module contains:
//! - Runtime: configuration-driven assembly and lifecycle
//! - Metrics: Prometheus counters for tunnels and relayed bytes

pub mod metrics;
mod runtime;

pub use runtime::Runtime;
