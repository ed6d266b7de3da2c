//! Metrics Module
//!
//! Prometheus counters for relay activity and the HTTP endpoint exposing them.

pub mod collector;
pub mod server;

pub use collector::RelayMetrics;
pub use server::MetricsServer;
