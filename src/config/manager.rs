//! Configuration Manager

use super::{Config, InspectorConfig, RelayConfig};
use crate::Result;
use anyhow::{bail, Context};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Largest accepted read buffer per forwarding direction
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config = Self::parse(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Parse and validate TOML configuration text
    pub fn parse(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        config
            .validate()
            .with_context(|| "Configuration validation failed")?;
        Ok(config)
    }

    /// Load configuration from environment variables on top of the defaults.
    /// Not validated: the defaults only become usable once an upstream is set.
    pub fn load_from_env() -> Result<Config> {
        let mut config = Config::default();
        Self::apply_env(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `RELAYTAP_*` overrides to the first relay entry
    pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if config.relays.is_empty() {
            config.relays.push(RelayConfig::new(3001));
        }
        let relay = &mut config.relays[0];

        if let Some(port) = lookup("RELAYTAP_PORT") {
            relay.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid RELAYTAP_PORT: {}", port))?;
        }

        if let Some(bind_addr) = lookup("RELAYTAP_BIND_ADDR") {
            relay.bind_addr = bind_addr
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid RELAYTAP_BIND_ADDR: {}", bind_addr))?;
        }

        if let Some(host) = lookup("RELAYTAP_UPSTREAM_HOST") {
            relay.upstream_host = host;
        }

        if let Some(port) = lookup("RELAYTAP_UPSTREAM_PORT") {
            relay.upstream_port = Some(
                port.parse::<u16>()
                    .with_context(|| format!("Invalid RELAYTAP_UPSTREAM_PORT: {}", port))?,
            );
        }

        if let Some(buffer_size) = lookup("RELAYTAP_BUFFER_SIZE") {
            relay.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid RELAYTAP_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(delay) = lookup("RELAYTAP_RESTART_DELAY") {
            relay.restart_delay = humantime::parse_duration(&delay)
                .with_context(|| format!("Invalid RELAYTAP_RESTART_DELAY: {}", delay))?;
        }

        if let Some(log_level) = lookup("RELAYTAP_LOG_LEVEL") {
            config.log_level = log_level;
        }

        Ok(())
    }
}

/// Command-line overrides, applied to the first relay entry
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind_addr: Option<IpAddr>,
    pub upstream_host: Option<String>,
    pub upstream_port: Option<u16>,
    pub buffer_size: Option<usize>,
    pub inspector: Option<String>,
    pub capture_path: Option<PathBuf>,
}

impl Config {
    /// Merge command-line arguments (highest priority)
    pub fn merge_with_cli_args(&mut self, overrides: &CliOverrides) -> Result<()> {
        if self.relays.is_empty() {
            self.relays.push(RelayConfig::new(3001));
        }
        let relay = &mut self.relays[0];

        if let Some(port) = overrides.port {
            relay.port = port;
        }
        if let Some(bind_addr) = overrides.bind_addr {
            relay.bind_addr = bind_addr;
        }
        if let Some(host) = &overrides.upstream_host {
            relay.upstream_host = host.clone();
        }
        if let Some(port) = overrides.upstream_port {
            relay.upstream_port = Some(port);
        }
        if let Some(buffer_size) = overrides.buffer_size {
            relay.buffer_size = buffer_size;
        }

        if let Some(kind) = &overrides.inspector {
            self.inspector = match kind.as_str() {
                "noop" => InspectorConfig::Noop,
                "log" => InspectorConfig::default(),
                "capture" => {
                    let path = overrides
                        .capture_path
                        .clone()
                        .unwrap_or_else(|| PathBuf::from("relaytap-capture.jsonl"));
                    InspectorConfig::Capture { path }
                }
                other => bail!("Unknown inspector kind: {} (expected noop, log or capture)", other),
            };
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_relays()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_inspector()
            .with_context(|| "Inspector configuration validation failed")?;

        Ok(())
    }

    fn validate_relays(&self) -> Result<()> {
        if self.relays.is_empty() {
            bail!("at least one relay must be configured");
        }

        let mut ports = HashSet::new();
        for relay in &self.relays {
            if relay.port == 0 {
                bail!("relay port must be greater than 0");
            }

            if !ports.insert(relay.port) {
                bail!("duplicate relay port: {}", relay.port);
            }

            if relay.upstream_port == Some(0) {
                bail!("upstream_port for relay {} must be greater than 0", relay.port);
            }

            if relay.upstream_host.trim().is_empty() {
                bail!("upstream_host for relay {} cannot be empty", relay.port);
            }

            if relay.is_self_loop() {
                bail!(
                    "relay {} would forward to itself ({}); set upstream_host or upstream_port",
                    relay.port,
                    relay.upstream()
                );
            }

            if relay.buffer_size == 0 {
                bail!("buffer_size for relay {} must be greater than 0", relay.port);
            }

            if relay.buffer_size > MAX_BUFFER_SIZE {
                bail!("buffer_size for relay {} cannot exceed 1 MiB", relay.port);
            }
        }

        Ok(())
    }

    fn validate_inspector(&self) -> Result<()> {
        match &self.inspector {
            InspectorConfig::Capture { path } if path.as_os_str().is_empty() => {
                bail!("capture inspector requires a path");
            }
            InspectorConfig::Log { preview_bytes } if *preview_bytes == 0 => {
                bail!("preview_bytes must be greater than 0");
            }
            _ => Ok(()),
        }
    }
}
