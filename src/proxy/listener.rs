//! Listening endpoint and accept loop.
//!
//! The mux owns the listening socket, accepts connections forever, and
//! spawns one independent [`Session`] per connection. Transient accept
//! errors are retried with exponential backoff; anything else shuts the
//! loop down and surfaces to the caller.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn, Instrument};

use super::backend::{Backends, MuxListener};
use super::session::Session;
use super::sniff::{SniffConfig, DEFAULT_SNIFF_TIMEOUT};
use crate::config::Endpoint;

/// Initial backoff after a transient accept error.
const ACCEPT_BACKOFF_INITIAL: Duration = Duration::from_millis(5);

/// Backoff ceiling under sustained transient accept errors.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// fd-exhaustion errnos, the canonical transient accept failures.
#[cfg(unix)]
const ENFILE: i32 = 23;
#[cfg(unix)]
const EMFILE: i32 = 24;

/// Configuration for the mux listener.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Endpoint to listen on.
    pub listen: Endpoint,
    /// Per-read deadline during protocol sniffing.
    pub sniff_timeout: Duration,
}

impl MuxConfig {
    pub fn new(listen: Endpoint) -> Self {
        Self {
            listen,
            sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
        }
    }
}

/// Counters shared by the accept loop and every session.
#[derive(Debug, Default)]
pub struct MuxStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being sniffed or relayed.
    pub connections_active: AtomicU64,
    /// Total sessions finished (any outcome).
    pub connections_closed: AtomicU64,
    /// Connections classified as HTTPS.
    pub detected_https: AtomicU64,
    /// Connections classified as SSH by banner.
    pub detected_ssh: AtomicU64,
    /// Connections routed to the fallback backend.
    pub detected_other: AtomicU64,
    /// Connections routed to SSH because the sniff deadline elapsed.
    pub sniff_timeouts: AtomicU64,
    /// Backend dials that failed.
    pub dial_failures: AtomicU64,
    /// Bytes moved client -> backend (replay included).
    pub bytes_to_backend: AtomicU64,
    /// Bytes moved backend -> client.
    pub bytes_from_backend: AtomicU64,
}

/// The protocol-sniffing multiplexer.
pub struct Mux {
    config: MuxConfig,
    listener: MuxListener,
    backends: Arc<Backends>,
    stats: Arc<MuxStats>,
}

impl Mux {
    /// Bind the listening endpoint.
    pub async fn bind(config: MuxConfig, backends: Backends) -> io::Result<Self> {
        let listener = MuxListener::bind(&config.listen).await?;
        info!(listen = %config.listen, "Listener bound");

        Ok(Self {
            listener,
            config,
            backends: Arc::new(backends),
            stats: Arc::new(MuxStats::default()),
        })
    }

    /// Local address, when listening on a TCP socket. Useful with an
    /// ephemeral port.
    pub fn local_tcp_addr(&self) -> io::Result<Option<SocketAddr>> {
        self.listener.local_tcp_addr()
    }

    /// Shared statistics handle.
    pub fn stats(&self) -> Arc<MuxStats> {
        Arc::clone(&self.stats)
    }

    /// Accept connections until a fatal listener error.
    ///
    /// Transient accept errors back off exponentially from 5 ms to 1 s;
    /// one successful accept resets the delay. The loop never waits on
    /// any session.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        info!(listen = %self.config.listen, "Accepting connections");
        let mut backoff = Duration::ZERO;

        loop {
            match self.listener.accept().await {
                Ok((client, peer)) => {
                    backoff = Duration::ZERO;
                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let session = Session::new(
                        client,
                        Arc::clone(&self.backends),
                        SniffConfig {
                            timeout: self.config.sniff_timeout,
                        },
                        Arc::clone(&self.stats),
                    );
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = session.run().await {
                                debug!(error = %e, "Session error");
                            }
                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer)),
                    );
                }
                Err(e) if is_transient_accept(&e) => {
                    backoff = next_backoff(backoff);
                    warn!(
                        error = %e,
                        delay_ms = backoff.as_millis() as u64,
                        "Accept error; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    error!(error = %e, "Fatal accept error");
                    return Err(e);
                }
            }
        }
    }
}

/// Next delay in the accept backoff schedule: 5 ms doubling to a 1 s
/// cap, starting from zero after any successful accept.
fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        ACCEPT_BACKOFF_INITIAL
    } else {
        (current * 2).min(ACCEPT_BACKOFF_MAX)
    }
}

/// Whether an accept error is worth retrying.
fn is_transient_accept(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    ) {
        return true;
    }

    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(ENFILE) | Some(EMFILE)) {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap_and_resets() {
        let mut delay = Duration::ZERO;
        let mut previous = Duration::ZERO;

        for _ in 0..16 {
            delay = next_backoff(delay);
            assert!(delay >= previous, "backoff must be non-decreasing");
            assert!(delay <= ACCEPT_BACKOFF_MAX);
            previous = delay;
        }
        assert_eq!(delay, ACCEPT_BACKOFF_MAX);

        // A successful accept resets to zero, then the schedule restarts.
        assert_eq!(next_backoff(Duration::ZERO), ACCEPT_BACKOFF_INITIAL);
    }

    #[test]
    fn backoff_schedule_prefix() {
        let mut delay = next_backoff(Duration::ZERO);
        assert_eq!(delay, Duration::from_millis(5));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(10));
        delay = next_backoff(delay);
        assert_eq!(delay, Duration::from_millis(20));
    }

    #[test]
    fn transient_accept_classification() {
        assert!(is_transient_accept(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient_accept(&io::Error::from(
            io::ErrorKind::Interrupted
        )));
        assert!(!is_transient_accept(&io::Error::from(
            io::ErrorKind::PermissionDenied
        )));
        assert!(!is_transient_accept(&io::Error::from(
            io::ErrorKind::InvalidInput
        )));
    }

    #[cfg(unix)]
    #[test]
    fn fd_exhaustion_is_transient() {
        assert!(is_transient_accept(&io::Error::from_raw_os_error(EMFILE)));
        assert!(is_transient_accept(&io::Error::from_raw_os_error(ENFILE)));
    }
}
