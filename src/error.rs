//! Relay Error Types
//!
//! Failures observed by the relay core. Setup errors abort one attempt and are
//! retried by the supervisor; mid-relay errors end one forwarding direction.
//! None of them ever escape the supervisor loop.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::inspect::Direction;

/// Errors produced while building or running a relay session
#[derive(Error, Debug)]
pub enum RelayError {
    /// The downstream listener could not bind its port
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The one-shot accept failed
    #[error("failed to accept on port {port}: {source}")]
    Accept {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The upstream server is unreachable or refused the connection
    #[error("failed to connect to upstream {upstream}: {message}")]
    Connect {
        upstream: String,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The upstream closed its connection while the attempt waited for a client
    #[error("upstream {upstream} closed before a client connected")]
    UpstreamClosed {
        upstream: SocketAddr,
        #[source]
        source: Option<io::Error>,
    },

    /// Reading from the source side of a forwarding direction failed
    #[error("{direction} read failed on port {port}: {source}")]
    Read {
        port: u16,
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// Writing to the destination side of a forwarding direction failed
    #[error("{direction} write failed on port {port}: {source}")]
    Write {
        port: u16,
        direction: Direction,
        #[source]
        source: io::Error,
    },

    /// The peer closed its side of the stream
    #[error("{direction} peer closed the stream on port {port}")]
    PeerClosed { port: u16, direction: Direction },

    /// The inspection hook failed; never affects forwarding
    #[error("inspection failed: {0}")]
    Inspection(#[from] InspectionError),
}

impl RelayError {
    /// Short label used for logs and the setup failure metric
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } => "bind",
            RelayError::Accept { .. } => "accept",
            RelayError::Connect { .. } => "connect",
            RelayError::UpstreamClosed { .. } => "upstream_closed",
            RelayError::Read { .. } => "read",
            RelayError::Write { .. } => "write",
            RelayError::PeerClosed { .. } => "peer_closed",
            RelayError::Inspection(_) => "inspection",
        }
    }

    /// Whether this error happened before the session started relaying
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Bind { .. }
                | RelayError::Accept { .. }
                | RelayError::Connect { .. }
                | RelayError::UpstreamClosed { .. }
        )
    }
}

/// Error returned by an inspection hook
#[derive(Error, Debug)]
pub enum InspectionError {
    #[error("{0}")]
    Message(String),

    #[error("inspector panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

impl InspectionError {
    pub fn msg(message: impl Into<String>) -> Self {
        InspectionError::Message(message.into())
    }
}
