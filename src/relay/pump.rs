//! Forwarding Direction
//!
//! One half of a duplex relay: reads chunks from a source, hands each chunk
//! to the inspector, then writes it unmodified to the destination. The two
//! halves of a session share a [`Teardown`] so that the session ends as soon
//! as either of them does.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, trace, warn};

use crate::error::{InspectionError, RelayError};
use crate::inspect::{Direction, InspectionEvent, InspectorHandle};
use crate::metrics::RelayMetrics;

/// Session-wide stop signal. Fired by whichever direction ends first; once
/// fired it stays fired.
#[derive(Clone)]
pub struct Teardown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Teardown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal has fired, immediately if it already has
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of self
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a forwarding direction needs besides its two streams
#[derive(Clone)]
pub struct PumpContext {
    pub session_id: String,
    pub port: u16,
    pub direction: Direction,
    pub buffer_size: usize,
    pub inspector: InspectorHandle,
    pub metrics: Option<Arc<RelayMetrics>>,
    pub teardown: Teardown,
}

/// Why a forwarding direction stopped
#[derive(Debug)]
pub enum Termination {
    /// Zero-byte read: the source closed its side
    PeerClosed,
    /// Read or write failure
    Failed(RelayError),
    /// The opposite direction ended first
    TornDown,
    /// The task running the direction did not complete
    Aborted(String),
}

impl Termination {
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, Termination::PeerClosed)
    }
}

/// Outcome of one forwarding direction
#[derive(Debug)]
pub struct PumpReport {
    pub direction: Direction,
    pub bytes: u64,
    pub chunks: u64,
    pub inspection_failures: u64,
    pub termination: Termination,
}

impl PumpReport {
    pub fn aborted(direction: Direction, reason: String) -> Self {
        Self {
            direction,
            bytes: 0,
            chunks: 0,
            inspection_failures: 0,
            termination: Termination::Aborted(reason),
        }
    }
}

/// Forward `source` into `destination` until the source closes, an I/O
/// operation fails, or the session's teardown fires. Chunks are inspected
/// before they are written and are never merged, split or reordered. On exit
/// the destination's write side is shut down, best-effort, and teardown is
/// fired so the opposite direction stops too.
pub async fn pump<R, W>(source: &mut R, destination: &mut W, ctx: &PumpContext) -> PumpReport
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(ctx.buffer_size);
    let mut bytes: u64 = 0;
    let mut chunks: u64 = 0;
    let mut inspection_failures: u64 = 0;

    let termination = loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = ctx.teardown.triggered() => break Termination::TornDown,
            read = source.read_buf(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => break Termination::PeerClosed,
            Ok(n) => n,
            Err(e) => {
                break Termination::Failed(RelayError::Read {
                    port: ctx.port,
                    direction: ctx.direction,
                    source: e,
                })
            }
        };
        let chunk = &buf[..n];

        let event = InspectionEvent {
            session_id: &ctx.session_id,
            port: ctx.port,
            direction: ctx.direction,
            chunk,
        };
        if let Err(e) = ctx.inspector.inspect(&event) {
            inspection_failures += 1;
            report_inspection_failure(ctx, e);
        }

        // A peer that stops reading must not pin the session open
        let written = tokio::select! {
            biased;
            _ = ctx.teardown.triggered() => break Termination::TornDown,
            written = write_chunk(destination, chunk) => written,
        };
        if let Err(e) = written {
            break Termination::Failed(RelayError::Write {
                port: ctx.port,
                direction: ctx.direction,
                source: e,
            });
        }

        bytes += n as u64;
        chunks += 1;
        if let Some(metrics) = &ctx.metrics {
            metrics.record_chunk(ctx.port, ctx.direction, n);
        }
        trace!(
            session_id = %ctx.session_id,
            direction = %ctx.direction,
            len = n,
            "Forwarded chunk"
        );
    };

    ctx.teardown.trigger();

    if let Err(e) = destination.shutdown().await {
        debug!(
            session_id = %ctx.session_id,
            direction = %ctx.direction,
            error = %e,
            "Ignoring shutdown error on destination"
        );
    }

    match &termination {
        Termination::PeerClosed => {
            debug!(session_id = %ctx.session_id, direction = %ctx.direction, "Peer closed stream");
        }
        Termination::Failed(e) => {
            warn!(session_id = %ctx.session_id, direction = %ctx.direction, error = %e, "Forwarding stopped");
        }
        Termination::TornDown => {
            debug!(session_id = %ctx.session_id, direction = %ctx.direction, "Opposite direction ended, stopping");
        }
        Termination::Aborted(_) => {}
    }

    PumpReport {
        direction: ctx.direction,
        bytes,
        chunks,
        inspection_failures,
        termination,
    }
}

async fn write_chunk<W>(destination: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    destination.write_all(chunk).await?;
    destination.flush().await
}

fn report_inspection_failure(ctx: &PumpContext, e: InspectionError) {
    if let Some(metrics) = &ctx.metrics {
        metrics.record_inspection_failure(ctx.port);
    }

    let e = RelayError::from(e);
    match &e {
        RelayError::Inspection(InspectionError::Panicked(_)) => error!(
            session_id = %ctx.session_id,
            port = ctx.port,
            direction = %ctx.direction,
            error = %e,
            "Inspector panicked, chunk forwarded anyway"
        ),
        _ => warn!(
            session_id = %ctx.session_id,
            port = ctx.port,
            direction = %ctx.direction,
            error = %e,
            "Inspector failed, chunk forwarded anyway"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::NoopInspector;
    use std::io;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio_test::io::Builder;

    /// Destination that records every byte the moment it is written
    struct RecordingWriter {
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn context(inspector: InspectorHandle) -> PumpContext {
        PumpContext {
            session_id: "test-session".to_string(),
            port: 3001,
            direction: Direction::Client,
            buffer_size: 4096,
            inspector,
            metrics: None,
            teardown: Teardown::new(),
        }
    }

    #[tokio::test]
    async fn test_forwards_chunks_in_order() {
        let mut source = Builder::new().read(b"first").read(b"second").build();
        let mut destination = Builder::new().write(b"first").write(b"second").build();

        let report = pump(&mut source, &mut destination, &context(InspectorHandle::new(NoopInspector))).await;

        assert!(report.termination.is_peer_closed());
        assert_eq!(report.chunks, 2);
        assert_eq!(report.bytes, 11);
    }

    #[tokio::test]
    async fn test_inspects_each_chunk_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = seen.clone();
        let inspector = InspectorHandle::from_fn(move |event| {
            recorder
                .lock()
                .unwrap()
                .push((event.chunk.to_vec(), event.port, event.direction));
            Ok(())
        });

        let mut source = Builder::new().read(b"ping").read(b"pong").build();
        let mut destination = Builder::new().write(b"ping").write(b"pong").build();
        pump(&mut source, &mut destination, &context(inspector)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (b"ping".to_vec(), 3001, Direction::Client),
                (b"pong".to_vec(), 3001, Direction::Client),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_inspector_does_not_block_forwarding() {
        let inspector = InspectorHandle::from_fn(|event| {
            if event.chunk == b"bad" {
                Err(InspectionError::msg("cannot parse"))
            } else {
                Ok(())
            }
        });

        let mut source = Builder::new().read(b"ok").read(b"bad").read(b"after").build();
        let mut destination = Builder::new().write(b"ok").write(b"bad").write(b"after").build();
        let report = pump(&mut source, &mut destination, &context(inspector)).await;

        assert_eq!(report.chunks, 3);
        assert_eq!(report.inspection_failures, 1);
        assert!(report.termination.is_peer_closed());
    }

    #[tokio::test]
    async fn test_panicking_inspector_does_not_block_forwarding() {
        let inspector = InspectorHandle::from_fn(|_| panic!("inspector bug"));

        let mut source = Builder::new().read(b"data").build();
        let mut destination = Builder::new().write(b"data").build();
        let report = pump(&mut source, &mut destination, &context(inspector)).await;

        assert_eq!(report.chunks, 1);
        assert_eq!(report.inspection_failures, 1);
    }

    #[tokio::test]
    async fn test_read_error_terminates_direction() {
        let mut source = Builder::new()
            .read(b"partial")
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();
        let mut destination = Builder::new().write(b"partial").build();
        let report = pump(&mut source, &mut destination, &context(InspectorHandle::new(NoopInspector))).await;

        assert_eq!(report.chunks, 1);
        match report.termination {
            Termination::Failed(RelayError::Read { direction, .. }) => assert_eq!(direction, Direction::Client),
            other => panic!("expected read failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_error_terminates_direction() {
        let mut source = Builder::new().read(b"one").build();
        let mut destination = Builder::new()
            .write_error(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
            .build();
        let report = pump(&mut source, &mut destination, &context(InspectorHandle::new(NoopInspector))).await;

        assert_eq!(report.chunks, 0);
        assert!(matches!(
            report.termination,
            Termination::Failed(RelayError::Write { .. })
        ));
    }

    #[tokio::test]
    async fn test_inspector_swap_applies_mid_stream() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inspector = InspectorHandle::new(NoopInspector);

        let (mut client, mut relay_side) = tokio::io::duplex(64);
        let (mut relay_out, mut server) = tokio::io::duplex(64);

        let ctx = context(inspector.clone());
        let task = tokio::spawn(async move { pump(&mut relay_side, &mut relay_out, &ctx).await });

        let mut buf = [0u8; 3];

        client.write_all(b"one").await.unwrap();
        server.read_exact(&mut buf).await.unwrap();

        let recorder = seen.clone();
        inspector.swap_fn(move |event| {
            recorder.lock().unwrap().push(event.chunk.to_vec());
            Ok(())
        });

        client.write_all(b"two").await.unwrap();
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"two");

        drop(client);
        let report = task.await.unwrap();
        assert_eq!(report.chunks, 2);
        assert_eq!(*seen.lock().unwrap(), vec![b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_chunk_inspected_before_it_is_written() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let observed = Arc::new(Mutex::new(Vec::new()));

        let (sink, recorder) = (written.clone(), observed.clone());
        let inspector = InspectorHandle::from_fn(move |event| {
            // How much had reached the destination when this chunk was inspected
            let delivered = sink.lock().unwrap().len();
            recorder.lock().unwrap().push((event.chunk.to_vec(), delivered));
            Ok(())
        });

        let mut source = Builder::new().read(b"ping").read(b"pong").build();
        let mut destination = RecordingWriter {
            written: written.clone(),
        };
        pump(&mut source, &mut destination, &context(inspector)).await;

        assert_eq!(
            *observed.lock().unwrap(),
            vec![(b"ping".to_vec(), 0), (b"pong".to_vec(), 4)]
        );
        assert_eq!(*written.lock().unwrap(), b"pingpong".to_vec());
    }

    #[tokio::test]
    async fn test_finished_direction_fires_teardown() {
        let ctx = context(InspectorHandle::new(NoopInspector));
        let mut source = Builder::new().read(b"last").build();
        let mut destination = Builder::new().write(b"last").build();

        assert!(!ctx.teardown.is_triggered());
        let report = pump(&mut source, &mut destination, &ctx).await;

        assert!(report.termination.is_peer_closed());
        assert!(ctx.teardown.is_triggered());
    }

    #[tokio::test]
    async fn test_teardown_stops_blocked_read() {
        let ctx = context(InspectorHandle::new(NoopInspector));
        let teardown = ctx.teardown.clone();

        // Keep the writing end alive so the read never sees EOF
        let (_client, mut relay_side) = tokio::io::duplex(64);
        let (mut relay_out, mut server) = tokio::io::duplex(64);
        let task = tokio::spawn(async move { pump(&mut relay_side, &mut relay_out, &ctx).await });

        teardown.trigger();
        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("pump stopped after teardown")
            .unwrap();
        assert!(matches!(report.termination, Termination::TornDown));

        // The destination was shut down on the way out
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_stops_blocked_write() {
        let ctx = context(InspectorHandle::new(NoopInspector));
        let teardown = ctx.teardown.clone();

        // Nobody reads `_server`, so a chunk larger than the pipe blocks the write
        let (mut client, mut relay_side) = tokio::io::duplex(1024);
        let (mut relay_out, _server) = tokio::io::duplex(16);
        let task = tokio::spawn(async move { pump(&mut relay_side, &mut relay_out, &ctx).await });

        client.write_all(&[7u8; 512]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        teardown.trigger();

        let report = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("pump stopped after teardown")
            .unwrap();
        assert!(matches!(report.termination, Termination::TornDown));
        assert_eq!(report.chunks, 0);
    }
}
