//! Shutdown Handling
//!
//! Broadcasts a single shutdown signal to every supervisor. Shutdown is
//! immediate: supervisors drop their in-flight sessions without draining.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::Result;

/// Fans one shutdown request out to all components
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Request shutdown. Safe to call more than once.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        if self.shutdown_tx.send(()).is_err() {
            debug!("Shutdown requested with no listeners");
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Drive `signals` until shutdown is triggered. If the signal listener
    /// fails it is logged and only an explicit [`trigger`](Self::trigger)
    /// ends the wait.
    pub async fn run_until_shutdown<F>(&self, signals: F)
    where
        F: Future<Output = Result<()>>,
    {
        let mut shutdown_rx = self.subscribe();
        if self.is_triggered() {
            return;
        }

        tokio::pin!(signals);
        let mut listening = true;
        loop {
            tokio::select! {
                result = &mut signals, if listening => {
                    listening = false;
                    if let Err(e) = result {
                        error!("Error setting up signal handlers, waiting for console quit: {:#}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown requested");
                    return;
                }
            }
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, shutting down");
        }

        self.trigger();
        Ok(())
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
