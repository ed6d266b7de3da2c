//! Metrics HTTP Server
//!
//! Serves `/metrics` for Prometheus scraping and `/health` for liveness checks.

use crate::metrics::RelayMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// HTTP server for serving Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<RelayMetrics>,
    bind_addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<RelayMetrics>, bind_addr: SocketAddr) -> Self {
        Self { metrics, bind_addr }
    }

    /// Bind and serve until the task is dropped
    pub async fn start(&self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!(bind_addr = %listener.local_addr()?, "Metrics server started");

        loop {
            match listener.accept().await {
                Ok((mut stream, addr)) => {
                    debug!(client_addr = %addr, "Metrics request received");

                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_request(&mut stream, metrics).await {
                            error!(error = %e, client_addr = %addr, "Failed to handle metrics request");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept metrics connection");
                }
            }
        }
    }
}

async fn handle_request(stream: &mut TcpStream, metrics: Arc<RelayMetrics>) -> anyhow::Result<()> {
    let mut buffer = [0; 1024];
    let bytes_read = stream.read(&mut buffer).await?;

    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let response = if request.starts_with("GET /metrics") {
        let body = metrics.export_prometheus();
        format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain; version=0.0.4; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n\
             {}",
            body.len(),
            body
        )
    } else if request.starts_with("GET /health") {
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 2\r\n\
         Connection: close\r\n\
         \r\n\
         OK"
            .to_string()
    } else {
        "HTTP/1.1 404 Not Found\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: 9\r\n\
         Connection: close\r\n\
         \r\n\
         Not Found"
            .to_string()
    };

    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}
