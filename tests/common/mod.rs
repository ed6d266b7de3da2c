//! Shared helpers for relay integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relaytap::config::RelayConfig;
use relaytap::{InspectorHandle, Supervisor};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// A loopback port that nothing is listening on
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo every connection back to its sender until it closes
pub fn spawn_echo_server(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

pub async fn start_echo_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (port, spawn_echo_server(listener))
}

/// Relay on a fresh loopback port forwarding to `upstream_port`
pub async fn relay_config(upstream_port: u16) -> RelayConfig {
    let mut config = RelayConfig::new(free_port().await);
    config.bind_addr = "127.0.0.1".parse().unwrap();
    config.upstream_port = Some(upstream_port);
    config
}

/// Run a supervisor in the background; send on the returned channel to stop it
pub fn spawn_supervisor(supervisor: Arc<Supervisor>) -> (broadcast::Sender<()>, JoinHandle<()>) {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });
    (shutdown_tx, task)
}

pub fn start_relay(config: RelayConfig, inspector: InspectorHandle) -> (Arc<Supervisor>, broadcast::Sender<()>) {
    let supervisor = Arc::new(Supervisor::new(config, inspector));
    let (shutdown_tx, _) = spawn_supervisor(supervisor.clone());
    (supervisor, shutdown_tx)
}

/// The listener only exists between upstream connect and accept, so retry
pub async fn connect_with_retry(addr: SocketAddr) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        sleep(Duration::from_millis(25)).await;
    }
    panic!("relay at {} never accepted a connection", addr);
}

/// Write `payload` and read back the same number of bytes
pub async fn round_trip(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
    stream.write_all(payload).await.unwrap();
    let mut reply = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut reply))
        .await
        .expect("reply arrived in time")
        .unwrap();
    reply
}
