//! Configuration Module
//!
//! Handles configuration loading, validation, and hot reloading.

pub mod manager;
pub mod types;
pub mod watcher;

pub use manager::{CliOverrides, ConfigManager};
pub use types::*;
pub use watcher::{ConfigChangeEvent, ConfigWatcher, InspectorReloader};
