//! Data Relay Module
//!
//! Transparent one-client TCP relay: a listener and a connector per attempt,
//! two forwarding directions per session, and a supervisor that restarts
//! sessions forever.

pub mod connector;
pub mod listener;
pub mod pump;
pub mod session;
pub mod supervisor;

pub use connector::UpstreamConnector;
pub use listener::DownstreamListener;
pub use pump::{pump, PumpContext, PumpReport, Termination};
pub use session::{Session, SessionReport};
pub use supervisor::{Supervisor, SupervisorState, SupervisorStatus};
