//! Metrics Collector

use anyhow::Context;
use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};
use tracing::error;

use crate::inspect::Direction;
use crate::Result;

/// Prometheus counters for every supervised relay, labelled by port
pub struct RelayMetrics {
    registry: Registry,
    sessions_total: IntCounterVec,
    setup_failures_total: IntCounterVec,
    bytes_total: IntCounterVec,
    chunks_inspected_total: IntCounterVec,
    inspection_failures_total: IntCounterVec,
}

impl RelayMetrics {
    /// Create a collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let sessions_total = IntCounterVec::new(
            Opts::new("relaytap_sessions_total", "Relay sessions that reached the relaying state"),
            &["port"],
        )
        .context("Failed to create sessions_total counter")?;

        let setup_failures_total = IntCounterVec::new(
            Opts::new(
                "relaytap_setup_failures_total",
                "Relay attempts aborted before relaying (bind, accept or connect)",
            ),
            &["port", "kind"],
        )
        .context("Failed to create setup_failures_total counter")?;

        let bytes_total = IntCounterVec::new(
            Opts::new("relaytap_bytes_total", "Bytes forwarded through the relay"),
            &["port", "direction"],
        )
        .context("Failed to create bytes_total counter")?;

        let chunks_inspected_total = IntCounterVec::new(
            Opts::new(
                "relaytap_chunks_inspected_total",
                "Chunks handed to the inspection hook",
            ),
            &["port", "direction"],
        )
        .context("Failed to create chunks_inspected_total counter")?;

        let inspection_failures_total = IntCounterVec::new(
            Opts::new(
                "relaytap_inspection_failures_total",
                "Inspection hook calls that returned an error or panicked",
            ),
            &["port"],
        )
        .context("Failed to create inspection_failures_total counter")?;

        registry
            .register(Box::new(sessions_total.clone()))
            .context("Failed to register sessions_total")?;
        registry
            .register(Box::new(setup_failures_total.clone()))
            .context("Failed to register setup_failures_total")?;
        registry
            .register(Box::new(bytes_total.clone()))
            .context("Failed to register bytes_total")?;
        registry
            .register(Box::new(chunks_inspected_total.clone()))
            .context("Failed to register chunks_inspected_total")?;
        registry
            .register(Box::new(inspection_failures_total.clone()))
            .context("Failed to register inspection_failures_total")?;

        Ok(Self {
            registry,
            sessions_total,
            setup_failures_total,
            bytes_total,
            chunks_inspected_total,
            inspection_failures_total,
        })
    }

    pub fn record_session(&self, port: u16) {
        self.sessions_total
            .with_label_values(&[&port.to_string()])
            .inc();
    }

    pub fn record_setup_failure(&self, port: u16, kind: &str) {
        self.setup_failures_total
            .with_label_values(&[&port.to_string(), kind])
            .inc();
    }

    /// Count one inspected and forwarded chunk
    pub fn record_chunk(&self, port: u16, direction: Direction, bytes: usize) {
        let port = port.to_string();
        self.chunks_inspected_total
            .with_label_values(&[&port, direction.as_str()])
            .inc();
        self.bytes_total
            .with_label_values(&[&port, direction.as_str()])
            .inc_by(bytes as u64);
    }

    pub fn record_inspection_failure(&self, port: u16) {
        self.inspection_failures_total
            .with_label_values(&[&port.to_string()])
            .inc();
    }

    pub fn sessions(&self, port: u16) -> u64 {
        self.sessions_total.with_label_values(&[&port.to_string()]).get()
    }

    pub fn setup_failures(&self, port: u16, kind: &str) -> u64 {
        self.setup_failures_total
            .with_label_values(&[&port.to_string(), kind])
            .get()
    }

    pub fn bytes(&self, port: u16, direction: Direction) -> u64 {
        self.bytes_total
            .with_label_values(&[&port.to_string(), direction.as_str()])
            .get()
    }

    pub fn chunks_inspected(&self, port: u16, direction: Direction) -> u64 {
        self.chunks_inspected_total
            .with_label_values(&[&port.to_string(), direction.as_str()])
            .get()
    }

    pub fn inspection_failures(&self, port: u16) -> u64 {
        self.inspection_failures_total
            .with_label_values(&[&port.to_string()])
            .get()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "Failed to encode Prometheus metrics");
                String::new()
            }
        }
    }
}
