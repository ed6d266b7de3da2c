//! Upstream Connector

use std::io;
use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpStream};
use tracing::{debug, info, warn};

use crate::error::RelayError;

/// Opens the outbound connection of one relay attempt
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    host: String,
    port: u16,
}

impl UpstreamConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` as configured
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Resolve the upstream and connect to the first address that accepts.
    /// No deadline: blocks until connected or refused.
    pub async fn connect(&self) -> Result<(TcpStream, SocketAddr), RelayError> {
        debug!(upstream = %self.target(), "Connecting to upstream");

        let addrs: Vec<SocketAddr> = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| self.connect_error(format!("DNS resolution failed: {}", e), Some(e)))?
            .collect();

        let mut last_error: Option<io::Error> = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(upstream = %addr, error = %e, "Failed to set TCP_NODELAY on upstream stream");
                    }
                    info!(upstream = %addr, "Connected to upstream");
                    return Ok((stream, addr));
                }
                Err(e) => {
                    warn!(upstream = %addr, error = %e, "Failed to connect to upstream address");
                    last_error = Some(e);
                }
            }
        }

        Err(match last_error {
            Some(e) => self.connect_error(e.to_string(), Some(e)),
            None => self.connect_error("no addresses resolved".to_string(), None),
        })
    }

    /// Resolves when an idle upstream connection is closed by the server.
    /// Once the server has sent data this never resolves: the bytes stay
    /// queued for the session and only reading them could reveal a close.
    pub async fn closed(stream: &TcpStream) -> Option<io::Error> {
        let mut peeked = [0u8; 1];
        match stream.peek(&mut peeked).await {
            Ok(0) => None,
            Ok(_) => std::future::pending().await,
            Err(e) => Some(e),
        }
    }

    fn connect_error(&self, message: String, source: Option<io::Error>) -> RelayError {
        RelayError::Connect {
            upstream: self.target(),
            message,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connects_to_listening_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = UpstreamConnector::new("127.0.0.1", port);
        let (_stream, addr) = connector.connect().await.unwrap();
        assert_eq!(addr.port(), port);
        assert_eq!(connector.target(), format!("127.0.0.1:{}", port));
    }

    #[tokio::test]
    async fn test_refused_upstream_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = UpstreamConnector::new("127.0.0.1", port)
            .connect()
            .await
            .unwrap_err();
        assert!(err.is_setup_failure());
        assert_eq!(err.kind(), "connect");
    }

    #[tokio::test]
    async fn test_closed_detects_server_hangup() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (stream, _) = UpstreamConnector::new("127.0.0.1", port).connect().await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        let still_open = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            UpstreamConnector::closed(&stream),
        )
        .await;
        assert!(still_open.is_err());

        drop(accepted);
        tokio::time::timeout(std::time::Duration::from_secs(5), UpstreamConnector::closed(&stream))
            .await
            .expect("hangup was noticed");
    }

    #[tokio::test]
    async fn test_closed_ignores_pending_greeting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (stream, _) = UpstreamConnector::new("127.0.0.1", port).connect().await.unwrap();
        let (mut accepted, _) = listener.accept().await.unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut accepted, b"220 ready\r\n").await.unwrap();

        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(200),
            UpstreamConnector::closed(&stream),
        )
        .await;
        assert!(waiting.is_err(), "queued data is left for the session");

        let mut greeting = [0u8; 11];
        stream.peek(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"220 ready\r\n");
    }

    #[tokio::test]
    async fn test_resolves_hostnames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let result = UpstreamConnector::new("localhost", port).connect().await;
        // localhost may resolve to ::1 first; the v4 fallback must still win
        assert!(result.is_ok(), "expected localhost to connect: {:?}", result.err());
    }
}
