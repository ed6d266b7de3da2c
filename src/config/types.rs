//! Configuration Types

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Reference read size for a forwarding direction
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub relays: Vec<RelayConfig>,
    #[serde(default)]
    pub inspector: InspectorConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// One supervised relay: a local port forwarded to an upstream server
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RelayConfig {
    /// Local port the downstream listener binds
    pub port: u16,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,
    /// Upstream port; the local port when unset
    #[serde(default)]
    pub upstream_port: Option<u16>,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Pause between attempts. Zero restarts immediately.
    #[serde(default, with = "humantime_serde")]
    pub restart_delay: Duration,
}

impl RelayConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind_addr: default_bind_addr(),
            upstream_host: default_upstream_host(),
            upstream_port: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            restart_delay: Duration::ZERO,
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }

    pub fn upstream_port(&self) -> u16 {
        self.upstream_port.unwrap_or(self.port)
    }

    /// `host:port` of the upstream server
    pub fn upstream(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port())
    }

    /// Whether the upstream is this relay's own listening socket. Only
    /// loopback, wildcard and the bind address itself are recognised.
    pub fn is_self_loop(&self) -> bool {
        if self.upstream_port() != self.port {
            return false;
        }

        let bind = self.bind_addr;
        let host = self.upstream_host.trim();
        if host.eq_ignore_ascii_case("localhost") {
            return bind.is_unspecified() || bind.is_loopback();
        }

        match host.parse::<IpAddr>() {
            Ok(ip) if ip == bind => true,
            Ok(ip) if ip.is_loopback() || ip.is_unspecified() => {
                bind.is_unspecified() || bind.is_loopback()
            }
            _ => false,
        }
    }
}

/// Which inspector receives relayed chunks
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InspectorConfig {
    Noop,
    Log {
        #[serde(default = "default_preview_bytes")]
        preview_bytes: usize,
    },
    Capture {
        path: PathBuf,
    },
}

impl Default for InspectorConfig {
    fn default() -> Self {
        InspectorConfig::Log {
            preview_bytes: default_preview_bytes(),
        }
    }
}

/// Prometheus endpoint configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            relays: vec![RelayConfig::new(3001)],
            inspector: InspectorConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_upstream_host() -> String {
    "127.0.0.1".to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_preview_bytes() -> usize {
    64
}

fn default_metrics_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9090)
}
