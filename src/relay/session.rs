//! Relay Session
//!
//! A session pairs one accepted client with one upstream connection and owns
//! both streams until teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pump::{pump, PumpContext, PumpReport, Teardown};
use crate::inspect::{Direction, InspectorHandle};
use crate::metrics::RelayMetrics;

/// One relay attempt that reached the relaying state
#[derive(Debug)]
pub struct Session {
    pub session_id: String,
    pub port: u16,
    pub client_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    client: TcpStream,
    upstream: TcpStream,
}

/// Summary of a finished session
#[derive(Debug)]
pub struct SessionReport {
    pub session_id: String,
    pub port: u16,
    pub client_addr: SocketAddr,
    pub upstream_addr: SocketAddr,
    pub duration: Duration,
    /// client -> server
    pub upstream: PumpReport,
    /// server -> client
    pub downstream: PumpReport,
}

impl SessionReport {
    pub fn bytes_up(&self) -> u64 {
        self.upstream.bytes
    }

    pub fn bytes_down(&self) -> u64 {
        self.downstream.bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    /// Log session statistics
    pub fn log_stats(&self) {
        info!(
            session_id = %self.session_id,
            port = self.port,
            client_addr = %self.client_addr,
            upstream_addr = %self.upstream_addr,
            duration_ms = self.duration.as_millis() as u64,
            bytes_up = self.bytes_up(),
            bytes_down = self.bytes_down(),
            chunks_up = self.upstream.chunks,
            chunks_down = self.downstream.chunks,
            inspection_failures = self.upstream.inspection_failures + self.downstream.inspection_failures,
            "Relay session completed"
        );
    }
}

impl Session {
    pub fn new(
        port: u16,
        client: TcpStream,
        client_addr: SocketAddr,
        upstream: TcpStream,
        upstream_addr: SocketAddr,
    ) -> Self {
        let session_id = format!("relay_{}_{}", port, Uuid::new_v4().simple());
        debug!(
            "Creating new relay session: {} ({} -> {})",
            session_id, client_addr, upstream_addr
        );

        Self {
            session_id,
            port,
            client_addr,
            upstream_addr,
            client,
            upstream,
        }
    }

    /// Run both forwarding directions on their own tasks. The session ends as
    /// soon as either direction sees EOF or an error: that direction fires the
    /// shared teardown, the other one stops at its next read or write, and
    /// both streams are closed on return.
    pub async fn relay(
        self,
        inspector: &InspectorHandle,
        buffer_size: usize,
        metrics: Option<Arc<RelayMetrics>>,
    ) -> SessionReport {
        let started = Instant::now();
        let Session {
            session_id,
            port,
            client_addr,
            upstream_addr,
            client,
            upstream,
        } = self;

        info!(
            "Started relay session {} from {} to {}",
            session_id, client_addr, upstream_addr
        );

        let teardown = Teardown::new();
        let context = |direction: Direction| PumpContext {
            session_id: session_id.clone(),
            port,
            direction,
            buffer_size,
            inspector: inspector.clone(),
            metrics: metrics.clone(),
            teardown: teardown.clone(),
        };
        let client_ctx = context(Direction::Client);
        let server_ctx = context(Direction::Server);

        let (mut client_read, mut client_write) = client.into_split();
        let (mut upstream_read, mut upstream_write) = upstream.into_split();

        let client_to_server = tokio::spawn(async move {
            let report = pump(&mut client_read, &mut upstream_write, &client_ctx).await;
            (report, client_read, upstream_write)
        });
        let server_to_client = tokio::spawn(async move {
            let report = pump(&mut upstream_read, &mut client_write, &server_ctx).await;
            (report, upstream_read, client_write)
        });

        let (up, down) = tokio::join!(client_to_server, server_to_client);

        let (upstream_report, downstream_report) = match (up, down) {
            (Ok((up_report, client_read, upstream_write)), Ok((down_report, upstream_read, client_write))) => {
                close(&session_id, "client", client_read, client_write);
                close(&session_id, "upstream", upstream_read, upstream_write);
                (up_report, down_report)
            }
            (up, down) => {
                // A task that did not complete has already dropped its halves
                let up_report = match up {
                    Ok((report, ..)) => report,
                    Err(e) => PumpReport::aborted(Direction::Client, e.to_string()),
                };
                let down_report = match down {
                    Ok((report, ..)) => report,
                    Err(e) => PumpReport::aborted(Direction::Server, e.to_string()),
                };
                warn!(session_id = %session_id, "Forwarding task did not complete cleanly");
                (up_report, down_report)
            }
        };

        SessionReport {
            session_id,
            port,
            client_addr,
            upstream_addr,
            duration: started.elapsed(),
            upstream: upstream_report,
            downstream: downstream_report,
        }
    }
}

/// Reassemble a stream from its halves and drop it, closing the socket
fn close(session_id: &str, side: &str, read: OwnedReadHalf, write: OwnedWriteHalf) {
    match read.reunite(write) {
        Ok(stream) => {
            drop(stream);
            debug!(session_id = %session_id, side, "Closed connection");
        }
        Err(e) => {
            // Mismatched halves; dropping both still closes each socket
            warn!(session_id = %session_id, side, error = %e, "Failed to reunite stream halves");
        }
    }
}
