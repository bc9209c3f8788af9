//! Bidirectional relay engine.
//!
//! Two directional copy tasks run concurrently, one per direction. The
//! first task to finish ends the session; the straggler is cancelled and
//! awaited before the relay returns, so no copy task ever outlives its
//! session. Dropping the stream halves on task exit closes both sockets.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::backend::Stream;
use super::listener::MuxStats;

/// Copy buffer size for each relay direction.
pub const BUFFER_SIZE: usize = 4096;

/// Idle deadline per read, re-armed on every iteration. Expiry is not a
/// failure; it only bounds how long a dead socket can be held in a
/// half-closed wait.
pub const RELAY_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay bytes between the client and the backend until either
/// direction terminates.
///
/// Byte counters are updated on `stats` as data flows, so progress made
/// by a direction that is later cancelled is still accounted for.
pub async fn relay(client: Stream, backend: Stream, stats: Arc<MuxStats>) {
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    let mut upstream = tokio::spawn(copy_direction(
        Direction::ToBackend,
        client_read,
        backend_write,
        Arc::clone(&stats),
    ));
    let mut downstream = tokio::spawn(copy_direction(
        Direction::FromBackend,
        backend_read,
        client_write,
        stats,
    ));

    tokio::select! {
        _ = &mut upstream => {
            downstream.abort();
            let _ = downstream.await;
        }
        _ = &mut downstream => {
            upstream.abort();
            let _ = upstream.await;
        }
    }
}

/// Which way a copy task moves bytes, for logging and accounting.
#[derive(Debug, Clone, Copy)]
enum Direction {
    ToBackend,
    FromBackend,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::ToBackend => "client->backend",
            Direction::FromBackend => "backend->client",
        }
    }

    fn record(self, stats: &MuxStats, n: u64) {
        match self {
            Direction::ToBackend => stats.bytes_to_backend.fetch_add(n, Ordering::Relaxed),
            Direction::FromBackend => stats.bytes_from_backend.fetch_add(n, Ordering::Relaxed),
        };
    }
}

/// One directional copy loop.
///
/// Terminates on source end-of-stream (propagated to the destination as
/// a write-side shutdown) or on a permanent read/write error. Idle
/// timeouts and transient errors re-arm and continue.
async fn copy_direction<R, W>(
    direction: Direction,
    mut src: R,
    mut dst: W,
    stats: Arc<MuxStats>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = match timeout(RELAY_IDLE_TIMEOUT, src.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) if is_transient(&e) => continue,
            Ok(Err(e)) => {
                debug!(direction = direction.label(), error = %e, "Read failed");
                return Err(e);
            }
        };

        write_chunk(&mut dst, &buf[..n], direction).await?;
        direction.record(&stats, n as u64);
    }

    // Source closed: propagate the end-of-stream to the peer.
    let _ = dst.shutdown().await;
    Ok(())
}

/// Write one chunk completely, retrying transient errors from where the
/// write left off so no byte is dropped or duplicated.
async fn write_chunk<W>(dst: &mut W, chunk: &[u8], direction: Direction) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < chunk.len() {
        match dst.write(&chunk[written..]).await {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "destination closed",
                ));
            }
            Ok(n) => written += n,
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                debug!(direction = direction.label(), error = %e, "Write failed");
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Errors the relay retries instead of ending the direction.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_delivers_bytes_and_propagates_eof() {
        let (mut src_far, src_near) = tokio::io::duplex(64);
        let (dst_near, mut dst_far) = tokio::io::duplex(64);
        let stats = Arc::new(MuxStats::default());

        let task = tokio::spawn(copy_direction(
            Direction::ToBackend,
            src_near,
            dst_near,
            Arc::clone(&stats),
        ));

        src_far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        dst_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Closing the source must surface as EOF on the destination.
        src_far.shutdown().await.unwrap();
        let n = dst_far.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);

        task.await.unwrap().unwrap();
        assert_eq!(stats.bytes_to_backend.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn write_chunk_is_exact() {
        let (mut near, mut far) = tokio::io::duplex(8);

        let payload = b"0123456789abcdef0123456789abcdef";
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            let mut buf = [0u8; 8];
            while out.len() < 32 {
                let n = far.read(&mut buf).await.unwrap();
                assert_ne!(n, 0);
                out.extend_from_slice(&buf[..n]);
            }
            out
        });

        write_chunk(&mut near, payload, Direction::ToBackend)
            .await
            .unwrap();
        assert_eq!(reader.await.unwrap(), payload);
    }

    #[test]
    fn transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient(&io::Error::from(
            io::ErrorKind::ConnectionReset
        )));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::BrokenPipe)));
    }
}
