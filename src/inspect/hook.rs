//! Inspection Hook
//!
//! The relay hands every chunk it forwards to an [`Inspector`]. The active
//! inspector lives behind an [`InspectorHandle`] and can be replaced while
//! sessions are running; each chunk is inspected by whichever inspector is
//! current at the moment the chunk is read.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::InspectionError;

/// Which way a chunk is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// client -> server
    Client,
    /// server -> client
    Server,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Client => "client",
            Direction::Server => "server",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One relayed chunk as seen by an inspector. Borrowed, never retained.
#[derive(Debug, Clone, Copy)]
pub struct InspectionEvent<'a> {
    pub session_id: &'a str,
    pub port: u16,
    pub direction: Direction,
    pub chunk: &'a [u8],
}

/// Passive observer of relayed traffic
pub trait Inspector: Send + Sync {
    /// Observe one chunk. Errors are logged by the relay and otherwise ignored.
    fn inspect(&self, event: &InspectionEvent<'_>) -> Result<(), InspectionError>;

    /// Name used in logs when inspectors are swapped
    fn name(&self) -> &str {
        "custom"
    }
}

/// Adapts a closure into an [`Inspector`]
pub struct FnInspector<F> {
    name: String,
    f: F,
}

impl<F> FnInspector<F>
where
    F: Fn(&InspectionEvent<'_>) -> Result<(), InspectionError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> Inspector for FnInspector<F>
where
    F: Fn(&InspectionEvent<'_>) -> Result<(), InspectionError> + Send + Sync,
{
    fn inspect(&self, event: &InspectionEvent<'_>) -> Result<(), InspectionError> {
        (self.f)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Shared, hot-swappable reference to the active inspector
#[derive(Clone)]
pub struct InspectorHandle {
    current: Arc<ArcSwap<Box<dyn Inspector>>>,
}

impl InspectorHandle {
    /// Create a handle around an inspector
    pub fn new(inspector: impl Inspector + 'static) -> Self {
        let boxed: Box<dyn Inspector> = Box::new(inspector);
        Self {
            current: Arc::new(ArcSwap::from_pointee(boxed)),
        }
    }

    /// Create a handle around a closure
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&InspectionEvent<'_>) -> Result<(), InspectionError> + Send + Sync + 'static,
    {
        Self::new(FnInspector::new("fn", f))
    }

    /// Replace the active inspector. Chunks already being inspected finish
    /// with the old one; every later chunk sees the new one.
    pub fn swap(&self, inspector: impl Inspector + 'static) {
        let boxed: Box<dyn Inspector> = Box::new(inspector);
        let current = boxed.name().to_string();
        let previous = self.current.swap(Arc::new(boxed));
        info!(previous = previous.name(), current = %current, "Inspector swapped");
    }

    /// Replace the active inspector with a closure
    pub fn swap_fn<F>(&self, f: F)
    where
        F: Fn(&InspectionEvent<'_>) -> Result<(), InspectionError> + Send + Sync + 'static,
    {
        self.swap(FnInspector::new("fn", f));
    }

    /// Name of the active inspector
    pub fn name(&self) -> String {
        self.current.load().name().to_string()
    }

    /// Run the active inspector on one event. Panics inside the inspector are
    /// caught and reported as [`InspectionError::Panicked`].
    pub fn inspect(&self, event: &InspectionEvent<'_>) -> Result<(), InspectionError> {
        let inspector = self.current.load();
        match panic::catch_unwind(AssertUnwindSafe(|| inspector.inspect(event))) {
            Ok(result) => result,
            Err(payload) => Err(InspectionError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl fmt::Debug for InspectorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InspectorHandle")
            .field("current", &self.name())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
