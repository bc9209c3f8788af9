//! Per-connection session: sniff, decide, dial, replay, relay.
//!
//! Each accepted connection gets exactly one session, which owns the
//! client stream for its whole life. The session reads under a 500 ms
//! per-read deadline until a chunk classifies the protocol (or the
//! deadline itself decides for SSH), dials the chosen backend, replays
//! every sniffed chunk verbatim, then hands both streams to the relay
//! engine. Every failure is contained here; nothing a session does can
//! reach the accept loop or another session.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use super::backend::{BackendKind, Backends, Stream};
use super::listener::MuxStats;
use super::relay::{self, BUFFER_SIZE};
use super::sniff::{classify, SniffConfig};

/// How a routing decision was reached. A signature match and a sniff
/// deadline expiry route differently into the statistics even when they
/// pick the same backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    /// A sniffed chunk matched a protocol signature.
    Matched(BackendKind),
    /// The sniff deadline elapsed; silence routes to SSH.
    TimedOut,
}

impl Decision {
    fn backend(self) -> BackendKind {
        match self {
            Decision::Matched(kind) => kind,
            Decision::TimedOut => BackendKind::Ssh,
        }
    }
}

/// State for one accepted connection.
pub struct Session {
    client: Stream,
    backends: Arc<Backends>,
    sniff: SniffConfig,
    stats: Arc<MuxStats>,
}

impl Session {
    pub fn new(
        client: Stream,
        backends: Arc<Backends>,
        sniff: SniffConfig,
        stats: Arc<MuxStats>,
    ) -> Self {
        Self {
            client,
            backends,
            sniff,
            stats,
        }
    }

    /// Drive the session to completion. Both connections are closed on
    /// return (by drop), whatever path got us there.
    pub async fn run(mut self) -> io::Result<()> {
        debug!("Connection accepted");

        let mut decision_buffer: Vec<Vec<u8>> = Vec::new();
        let decision = match self.sniff_protocol(&mut decision_buffer).await? {
            Some(decision) => decision,
            // Client went away before a decision; no backend is dialed.
            None => {
                debug!("Client closed during sniffing");
                return Ok(());
            }
        };

        self.record_decision(decision);
        let kind = decision.backend();
        debug!(backend = %kind, sniffed_chunks = decision_buffer.len(), "Protocol decided");

        let mut backend = match self.backends.dial(kind).await {
            Ok(stream) => stream,
            Err(e) => {
                self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                debug!(backend = %kind, error = %e, "Backend dial failed");
                return Ok(());
            }
        };

        // Replay the sniffed chunks, in order and in full, before any
        // live traffic flows.
        for chunk in &decision_buffer {
            backend.write_all(chunk).await?;
            self.stats
                .bytes_to_backend
                .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
        drop(decision_buffer);

        relay::relay(self.client, backend, Arc::clone(&self.stats)).await;
        debug!("Connection closed");
        Ok(())
    }

    /// The sniffing loop. Returns the routing decision, `None` when the
    /// client reached end-of-stream before one was made, or the read
    /// error that abandoned the session.
    ///
    /// Every chunk read lands in `decision_buffer` exactly as it
    /// arrived; classification looks at each new chunk in isolation.
    async fn sniff_protocol(
        &mut self,
        decision_buffer: &mut Vec<Vec<u8>>,
    ) -> io::Result<Option<Decision>> {
        let has_fallback = self.backends.has_fallback();
        let mut buf = vec![0u8; BUFFER_SIZE];

        loop {
            // Deadline is measured from now on every read; a client
            // drip-feeding bytes can sniff indefinitely.
            let n = match timeout(self.sniff.timeout, self.client.read(&mut buf)).await {
                Err(_) => {
                    // Some SSH clients wait for the server's banner, so
                    // silence is itself an SSH signal.
                    debug!("Sniff deadline elapsed; assuming SSH");
                    return Ok(Some(Decision::TimedOut));
                }
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e),
            };

            decision_buffer.push(buf[..n].to_vec());

            if let Some(kind) = classify(&buf[..n], has_fallback) {
                return Ok(Some(Decision::Matched(kind)));
            }
        }
    }

    /// A timeout decision counts only as a timeout; `detected_*` track
    /// signature matches alone.
    fn record_decision(&self, decision: Decision) {
        let counter = match decision {
            Decision::Matched(BackendKind::Ssh) => &self.stats.detected_ssh,
            Decision::Matched(BackendKind::Https) => &self.stats.detected_https,
            Decision::Matched(BackendKind::Other) => &self.stats.detected_other,
            Decision::TimedOut => &self.stats.sniff_timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};

    fn test_backends() -> Arc<Backends> {
        Arc::new(Backends::new(
            Endpoint::tcp("127.0.0.1:1"),
            Endpoint::tcp("127.0.0.1:1"),
            None,
        ))
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (accepted, _) = listener.accept().await.unwrap();
        (accepted, connect.await.unwrap())
    }

    fn session_with(client: TcpStream, sniff_timeout: Duration) -> Session {
        Session::new(
            Stream::Tcp(client),
            test_backends(),
            SniffConfig {
                timeout: sniff_timeout,
            },
            Arc::new(MuxStats::default()),
        )
    }

    #[tokio::test]
    async fn sniff_buffers_short_chunks_until_decision() {
        let (server_side, mut client) = socket_pair().await;
        let mut session = session_with(server_side, Duration::from_secs(2));

        let writer = tokio::spawn(async move {
            client.write_all(b"SS").await.unwrap();
            client.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            client.write_all(b"SSH-2.0-client\r\n").await.unwrap();
            client
        });

        let mut buffer = Vec::new();
        let decision = session.sniff_protocol(&mut buffer).await.unwrap();
        assert_eq!(decision, Some(Decision::Matched(BackendKind::Ssh)));

        // Both chunks captured, in arrival order, byte for byte.
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer[0], b"SS");
        assert_eq!(buffer[1], b"SSH-2.0-client\r\n");

        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn sniff_timeout_decides_ssh() {
        let (server_side, client) = socket_pair().await;
        let mut session = session_with(server_side, Duration::from_millis(50));

        let mut buffer = Vec::new();
        let decision = session.sniff_protocol(&mut buffer).await.unwrap();
        assert_eq!(decision, Some(Decision::TimedOut));
        assert!(buffer.is_empty());

        drop(client);
    }

    #[tokio::test]
    async fn timeout_decision_counts_only_as_timeout() {
        let (server_side, client) = socket_pair().await;
        let stats = Arc::new(MuxStats::default());
        let mut session = Session::new(
            Stream::Tcp(server_side),
            test_backends(),
            SniffConfig {
                timeout: Duration::from_millis(50),
            },
            Arc::clone(&stats),
        );

        let mut buffer = Vec::new();
        let decision = session
            .sniff_protocol(&mut buffer)
            .await
            .unwrap()
            .expect("silence must still produce a decision");
        assert_eq!(decision.backend(), BackendKind::Ssh);

        session.record_decision(decision);
        assert_eq!(stats.sniff_timeouts.load(Ordering::Relaxed), 1);
        // The deadline decided the route; no signature was detected.
        assert_eq!(stats.detected_ssh.load(Ordering::Relaxed), 0);
        assert_eq!(stats.detected_https.load(Ordering::Relaxed), 0);
        assert_eq!(stats.detected_other.load(Ordering::Relaxed), 0);

        drop(client);
    }

    #[tokio::test]
    async fn sniff_eof_abandons_without_decision() {
        let (server_side, client) = socket_pair().await;
        drop(client);

        let mut session = session_with(server_side, Duration::from_secs(2));
        let mut buffer = Vec::new();
        let decision = session.sniff_protocol(&mut buffer).await.unwrap();
        assert_eq!(decision, None);
    }

    #[tokio::test]
    async fn tls_chunk_decides_https() {
        let (server_side, mut client) = socket_pair().await;
        let mut session = session_with(server_side, Duration::from_secs(2));

        client.write_all(&[0x16, 0x03, 0x01, 0x00, 0x05]).await.unwrap();

        let mut buffer = Vec::new();
        let decision = session.sniff_protocol(&mut buffer).await.unwrap();
        assert_eq!(decision, Some(Decision::Matched(BackendKind::Https)));
        assert_eq!(buffer, vec![vec![0x16, 0x03, 0x01, 0x00, 0x05]]);
    }
}
