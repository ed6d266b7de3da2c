//! Traffic Inspection
//!
//! Passive observers that receive a copy of every relayed chunk.

pub mod builtin;
pub mod hook;

pub use builtin::{build_inspector, CaptureInspector, CaptureRecord, LogInspector, NoopInspector};
pub use hook::{Direction, FnInspector, InspectionEvent, Inspector, InspectorHandle};
