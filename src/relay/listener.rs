//! Downstream Listener
//!
//! Binds the local port for exactly one inbound connection. A fresh listener
//! is built for every relay attempt and consumed by its accept.

use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info};

use crate::error::RelayError;

/// One-shot listener owned by a single relay attempt
#[derive(Debug)]
pub struct DownstreamListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl DownstreamListener {
    /// Bind and listen with a backlog of one
    pub fn bind(addr: SocketAddr) -> Result<Self, RelayError> {
        let bind_error = |source| RelayError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;

        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        let listener = socket.listen(1).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        info!(addr = %local_addr, "Listening for one client");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the single client of this attempt. The listening socket is
    /// closed once the client is accepted.
    pub async fn accept_one(self) -> Result<(TcpStream, SocketAddr), RelayError> {
        let (stream, peer) = self.listener.accept().await.map_err(|source| RelayError::Accept {
            port: self.local_addr.port(),
            source,
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY on client stream");
        }

        info!(peer = %peer, port = self.local_addr.port(), "Accepted client connection");
        Ok((stream, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_accept_one_client() {
        let listener = DownstreamListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
        });

        let (mut stream, peer) = listener.accept_one().await.unwrap();
        assert!(peer.ip().is_loopback());

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_fails_when_port_in_use() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = occupied.local_addr().unwrap();

        match DownstreamListener::bind(addr) {
            Err(RelayError::Bind { addr: failed, .. }) => assert_eq!(failed, addr),
            other => panic!("expected bind error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_port_is_released_after_accept() {
        let listener = DownstreamListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr();

        let _client = TcpStream::connect(addr).await.unwrap();
        let (_stream, _) = listener.accept_one().await.unwrap();

        // The next attempt rebinds the same port while the session is alive
        let rebound = DownstreamListener::bind(addr).unwrap();
        assert_eq!(rebound.local_addr(), addr);
    }
}
