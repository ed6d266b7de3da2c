//! Configuration File Watcher
//!
//! Reloads the configuration file when it changes on disk. Inspector changes
//! are applied to running relays; relay changes take effect on restart.

use super::{Config, ConfigManager, InspectorConfig, RelayConfig};
use crate::inspect::{build_inspector, InspectorHandle};
use crate::Result;
use anyhow::{bail, Context};
use arc_swap::ArcSwap;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{debug, error, info, warn};

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChangeEvent {
    pub config: Arc<Config>,
    pub timestamp: std::time::SystemTime,
    pub file_path: PathBuf,
}

/// Configuration file watcher
pub struct ConfigWatcher {
    config_path: PathBuf,
    current_config: Arc<ArcSwap<Config>>,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// Create a new configuration watcher
    pub fn new(config_path: PathBuf) -> Result<Self> {
        let (change_sender, _) = broadcast::channel(100);

        let initial_config = ConfigManager::load_from_file(&config_path)?;
        let current_config = Arc::new(ArcSwap::from_pointee(initial_config));

        let sender_clone = change_sender.clone();
        let config_clone = current_config.clone();
        let path_clone = config_path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    Self::handle_file_event(event, &path_clone, &config_clone, &sender_clone);
                }
                Err(e) => error!("File watcher error: {}", e),
            },
            NotifyConfig::default(),
        )
        .context("Failed to create file watcher")?;

        // Watching the directory survives editors that replace the file
        if let Some(parent_dir) = config_path.parent() {
            watcher
                .watch(parent_dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch directory: {}", parent_dir.display()))?;

            info!("Started watching configuration directory: {}", parent_dir.display());
        } else {
            bail!("Configuration file has no parent directory: {}", config_path.display());
        }

        Ok(Self {
            config_path,
            current_config,
            change_sender,
            _watcher: watcher,
        })
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        self.current_config.load_full()
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> BroadcastStream<ConfigChangeEvent> {
        BroadcastStream::new(self.change_sender.subscribe())
    }

    /// Force reload the configuration
    pub fn reload(&self) -> Result<()> {
        info!("Force reloading configuration from: {}", self.config_path.display());

        match ConfigManager::load_from_file(&self.config_path) {
            Ok(new_config) => {
                Self::publish(new_config, &self.config_path, &self.current_config, &self.change_sender);
                Ok(())
            }
            Err(e) => {
                error!("Failed to reload configuration: {:#}", e);
                Err(e)
            }
        }
    }

    fn publish(
        new_config: Config,
        config_path: &Path,
        current_config: &ArcSwap<Config>,
        sender: &broadcast::Sender<ConfigChangeEvent>,
    ) {
        let config_arc = Arc::new(new_config);
        current_config.store(config_arc.clone());

        let event = ConfigChangeEvent {
            config: config_arc,
            timestamp: std::time::SystemTime::now(),
            file_path: config_path.to_path_buf(),
        };

        if let Err(e) = sender.send(event) {
            warn!("No subscribers for config change event: {}", e);
        }

        info!("Configuration reloaded successfully");
    }

    /// Handle file system events. Runs on the notify thread.
    fn handle_file_event(
        event: Event,
        config_path: &Path,
        current_config: &ArcSwap<Config>,
        sender: &broadcast::Sender<ConfigChangeEvent>,
    ) {
        debug!("File event: {:?}", event);

        let affects_config = event
            .paths
            .iter()
            .any(|path| path.file_name() == config_path.file_name());

        if !affects_config {
            return;
        }

        match event.kind {
            EventKind::Modify(_) | EventKind::Create(_) => {
                // Let the writer finish
                std::thread::sleep(std::time::Duration::from_millis(100));

                match ConfigManager::load_from_file(config_path) {
                    Ok(new_config) => {
                        if *current_config.load_full() == new_config {
                            debug!("Configuration content unchanged, ignoring event");
                            return;
                        }
                        info!("Configuration file changed, reloading...");
                        Self::publish(new_config, config_path, current_config, sender);
                    }
                    Err(e) => {
                        error!("Failed to reload configuration, keeping current config: {:#}", e);
                    }
                }
            }
            EventKind::Remove(_) => {
                warn!("Configuration file was removed: {}", config_path.display());
            }
            _ => {
                debug!("Ignoring file event type: {:?}", event.kind);
            }
        }
    }
}

/// Applies reloaded configuration to the live inspector handle
pub struct InspectorReloader {
    handle: InspectorHandle,
    active_inspector: InspectorConfig,
    active_relays: Vec<RelayConfig>,
}

impl InspectorReloader {
    pub fn new(handle: InspectorHandle, config: &Config) -> Self {
        Self {
            handle,
            active_inspector: config.inspector.clone(),
            active_relays: config.relays.clone(),
        }
    }

    /// Apply one configuration. Returns whether the inspector was swapped.
    pub fn apply(&mut self, config: &Config) -> Result<bool> {
        if config.relays != self.active_relays {
            warn!("Relay configuration changed; restart relaytap to apply it");
            self.active_relays = config.relays.clone();
        }

        if config.inspector == self.active_inspector {
            return Ok(false);
        }

        let inspector = build_inspector(&config.inspector)
            .context("Failed to build reloaded inspector")?;
        self.handle.swap(inspector);
        self.active_inspector = config.inspector.clone();
        info!(inspector = ?self.active_inspector, "Inspector reloaded");
        Ok(true)
    }

    /// Apply every change published by a watcher
    pub fn spawn(mut self, mut changes: BroadcastStream<ConfigChangeEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(change_event) = changes.next().await {
                match change_event {
                    Ok(event) => {
                        info!("Applying configuration change from: {}", event.file_path.display());
                        if let Err(e) = self.apply(&event.config) {
                            error!("Failed to apply configuration change: {:#}", e);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving configuration change: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{Direction, InspectionEvent, NoopInspector};
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::{sleep, Duration};

    const INITIAL_CONFIG: &str = r#"
[[relays]]
port = 3001
upstream_host = "10.0.0.5"

[inspector]
kind = "noop"
"#;

    #[tokio::test]
    async fn test_config_watcher_creation() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("relaytap.toml");
        fs::write(&config_path, INITIAL_CONFIG).unwrap();

        let watcher = ConfigWatcher::new(config_path.clone()).unwrap();

        let config = watcher.get_config();
        assert_eq!(config.relays[0].port, 3001);
        assert_eq!(config.inspector, InspectorConfig::Noop);
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_current() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("relaytap.toml");
        fs::write(&config_path, INITIAL_CONFIG).unwrap();

        let watcher = ConfigWatcher::new(config_path.clone()).unwrap();
        let mut change_stream = watcher.subscribe();

        fs::write(&config_path, "invalid toml content [[[").unwrap();
        sleep(Duration::from_millis(500)).await;

        assert_eq!(watcher.get_config().relays[0].port, 3001);
        assert!(watcher.reload().is_err());

        tokio::select! {
            _ = change_stream.next() => {
                panic!("Change event should not be emitted for invalid config");
            }
            _ = sleep(Duration::from_millis(200)) => {}
        }
    }

    #[test]
    fn test_reloader_swaps_only_on_inspector_change() {
        let config = ConfigManager::parse(INITIAL_CONFIG).unwrap();
        let handle = InspectorHandle::new(NoopInspector);
        let mut reloader = InspectorReloader::new(handle.clone(), &config);

        assert!(!reloader.apply(&config).unwrap());
        assert_eq!(handle.name(), "noop");

        let mut changed = config.clone();
        changed.inspector = InspectorConfig::Log { preview_bytes: 8 };
        assert!(reloader.apply(&changed).unwrap());
        assert_eq!(handle.name(), "log");

        let event = InspectionEvent {
            session_id: "s",
            port: 3001,
            direction: Direction::Client,
            chunk: b"ping",
        };
        assert!(handle.inspect(&event).is_ok());
    }
}
