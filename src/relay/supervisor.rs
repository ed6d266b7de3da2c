//! Session Supervisor
//!
//! Runs relay attempts for one port forever:
//! `Idle -> Connecting -> Relaying -> TearingDown -> Idle`.
//! Every failure is logged and followed by a fresh attempt; nothing escapes
//! the loop.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument, warn};

use super::connector::UpstreamConnector;
use super::listener::DownstreamListener;
use super::session::{Session, SessionReport};
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::inspect::InspectorHandle;
use crate::metrics::RelayMetrics;

/// Where a supervisor is in its attempt cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Connecting,
    Relaying,
    TearingDown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Relaying => "relaying",
            SupervisorState::TearingDown => "tearing_down",
        };
        f.write_str(name)
    }
}

/// Snapshot published after every state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupervisorStatus {
    pub port: u16,
    pub state: SupervisorState,
    /// Attempts started so far, including the current one
    pub attempt: u64,
    /// Sessions that reached the relaying state and finished
    pub sessions_completed: u64,
    pub last_error: Option<String>,
}

/// Restarts relay sessions for one configured port indefinitely
pub struct Supervisor {
    config: RelayConfig,
    inspector: InspectorHandle,
    metrics: Option<Arc<RelayMetrics>>,
    status_tx: watch::Sender<SupervisorStatus>,
}

impl Supervisor {
    pub fn new(config: RelayConfig, inspector: InspectorHandle) -> Self {
        let (status_tx, _) = watch::channel(SupervisorStatus {
            port: config.port,
            state: SupervisorState::Idle,
            attempt: 0,
            sessions_completed: 0,
            last_error: None,
        });

        Self {
            config,
            inspector,
            metrics: None,
            status_tx,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RelayMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> SupervisorStatus {
        self.status_tx.borrow().clone()
    }

    /// Supervise until a shutdown signal arrives. In-flight sessions are
    /// abandoned, not drained.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        tokio::select! {
            _ = self.supervise() => {}
            _ = shutdown.recv() => {
                info!(port = self.config.port, "Supervisor received shutdown signal, abandoning session");
            }
        }
    }

    /// The attempt loop. Never returns.
    pub async fn supervise(&self) {
        info!(
            port = self.config.port,
            upstream = %self.config.upstream(),
            "Supervisor started"
        );

        loop {
            let attempt = self.status_tx.borrow().attempt + 1;
            self.status_tx.send_modify(|status| status.attempt = attempt);

            match self.run_attempt(attempt).await {
                Ok(report) => {
                    report.log_stats();
                    self.status_tx.send_modify(|status| {
                        status.sessions_completed += 1;
                        status.last_error = None;
                    });
                }
                Err(e) => {
                    warn!(
                        port = self.config.port,
                        attempt,
                        kind = e.kind(),
                        error = %e,
                        "Relay attempt failed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_setup_failure(self.config.port, e.kind());
                    }
                    self.status_tx
                        .send_modify(|status| status.last_error = Some(e.to_string()));
                }
            }

            self.set_state(SupervisorState::Idle);
            info!(port = self.config.port, "Restarting relay...");

            if self.config.restart_delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.config.restart_delay).await;
            }
        }
    }

    /// One full attempt: connect upstream, accept one client, relay, tear down.
    /// The upstream is connected first so no client is accepted while the
    /// upstream is unreachable.
    #[instrument(skip(self), fields(port = self.config.port))]
    async fn run_attempt(&self, attempt: u64) -> Result<SessionReport, RelayError> {
        self.set_state(SupervisorState::Connecting);
        info!("Setting up relay");

        let connector = UpstreamConnector::new(&self.config.upstream_host, self.config.upstream_port());
        let (upstream, upstream_addr) = connector.connect().await?;

        let listener = DownstreamListener::bind(self.config.listen_addr())?;

        // A server may drop an idle connection while no client shows up;
        // start over rather than hand the next client a dead upstream
        let (client, client_addr) = tokio::select! {
            accepted = listener.accept_one() => accepted?,
            source = UpstreamConnector::closed(&upstream) => {
                return Err(RelayError::UpstreamClosed {
                    upstream: upstream_addr,
                    source,
                });
            }
        };

        let session = Session::new(self.config.port, client, client_addr, upstream, upstream_addr);
        if let Some(metrics) = &self.metrics {
            metrics.record_session(self.config.port);
        }

        self.set_state(SupervisorState::Relaying);
        let report = session
            .relay(&self.inspector, self.config.buffer_size, self.metrics.clone())
            .await;

        self.set_state(SupervisorState::TearingDown);
        Ok(report)
    }

    fn set_state(&self, state: SupervisorState) {
        self.status_tx.send_modify(|status| status.state = state);
    }
}
