//! relaytap Library
//!
//! Transparent TCP relay that forwards traffic between one client and an
//! upstream server per session, handing a copy of every chunk to a
//! hot-swappable inspector, and restarting sessions forever.

pub mod config;
pub mod control;
pub mod error;
pub mod inspect;
pub mod metrics;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use error::{InspectionError, RelayError};
pub use inspect::{Direction, InspectionEvent, Inspector, InspectorHandle};
pub use relay::{Supervisor, SupervisorState, SupervisorStatus};
pub use shutdown::ShutdownCoordinator;

/// Common error type for application-level code
pub type Result<T> = anyhow::Result<T>;
