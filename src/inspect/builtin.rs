//! Built-in Inspectors

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{Direction, InspectionEvent, Inspector};
use crate::config::InspectorConfig;
use crate::error::InspectionError;

/// Ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInspector;

impl Inspector for NoopInspector {
    fn inspect(&self, _event: &InspectionEvent<'_>) -> Result<(), InspectionError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Logs a hex/ASCII preview of every chunk at debug level
#[derive(Debug, Clone)]
pub struct LogInspector {
    preview_bytes: usize,
}

impl LogInspector {
    pub fn new(preview_bytes: usize) -> Self {
        Self { preview_bytes }
    }
}

impl Inspector for LogInspector {
    fn inspect(&self, event: &InspectionEvent<'_>) -> Result<(), InspectionError> {
        let shown = event.chunk.len().min(self.preview_bytes);
        debug!(
            session_id = %event.session_id,
            port = event.port,
            direction = %event.direction,
            len = event.chunk.len(),
            truncated = shown < event.chunk.len(),
            "[{}] {}",
            event.direction,
            hex_preview(&event.chunk[..shown])
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Renders bytes as `70 69 6e 67 |ping|`
pub fn hex_preview(bytes: &[u8]) -> String {
    let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    let ascii: String = bytes
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect();
    format!("{} |{}|", hex.join(" "), ascii)
}

/// One line of a capture file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureRecord {
    pub timestamp: String,
    pub session_id: String,
    pub port: u16,
    pub direction: Direction,
    pub len: usize,
    /// base64 of the raw chunk
    pub data: String,
}

impl CaptureRecord {
    pub fn from_event(event: &InspectionEvent<'_>) -> Self {
        Self {
            timestamp: humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
            session_id: event.session_id.to_string(),
            port: event.port,
            direction: event.direction,
            len: event.chunk.len(),
            data: STANDARD.encode(event.chunk),
        }
    }

    /// Decode the captured chunk
    pub fn decode(&self) -> anyhow::Result<Vec<u8>> {
        STANDARD
            .decode(&self.data)
            .context("capture record holds invalid base64")
    }
}

/// Appends every chunk as a JSON line to a file
pub struct CaptureInspector {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl CaptureInspector {
    /// Open (or create) the capture file in append mode
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open capture file: {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Inspector for CaptureInspector {
    fn inspect(&self, event: &InspectionEvent<'_>) -> Result<(), InspectionError> {
        let record = CaptureRecord::from_event(event);
        let line = serde_json::to_string(&record)?;

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| InspectionError::msg("capture writer lock poisoned"))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;

        trace!(path = %self.path.display(), len = record.len, "Captured chunk");
        Ok(())
    }

    fn name(&self) -> &str {
        "capture"
    }
}

/// Build the inspector described by the configuration
pub fn build_inspector(config: &InspectorConfig) -> anyhow::Result<Box<dyn Inspector>> {
    let inspector: Box<dyn Inspector> = match config {
        InspectorConfig::Noop => Box::new(NoopInspector),
        InspectorConfig::Log { preview_bytes } => Box::new(LogInspector::new(*preview_bytes)),
        InspectorConfig::Capture { path } => Box::new(CaptureInspector::open(path)?),
    };
    Ok(inspector)
}

/// Lets a boxed inspector be installed through the generic handle API
impl Inspector for Box<dyn Inspector> {
    fn inspect(&self, event: &InspectionEvent<'_>) -> Result<(), InspectionError> {
        (**self).inspect(event)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
