//! tcpmux
//!
//! Protocol-sniffing TCP multiplexer: accepts connections on one
//! endpoint, detects TLS or SSH from the first bytes the client sends,
//! and transparently relays each connection to the matching backend.
//! Clients see a single port; sshd and the HTTPS server stay wherever
//! they already run.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tcpmux::{Backends, Endpoint, Mux, MuxConfig};

/// Multiplex SSH and HTTPS on a single listening port.
#[derive(Debug, Parser)]
#[command(name = "tcpmux")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listen URI (schemes available are tcp, unix).
    #[arg(short = 'l', long, env = "TCPMUX_LISTEN", default_value = "tcp://0.0.0.0:4444")]
    listen: Endpoint,

    /// Forward SSH traffic to an sshd listening at this URI.
    #[arg(long, env = "TCPMUX_SSH", default_value = "tcp://localhost:22")]
    ssh: Endpoint,

    /// Forward HTTPS traffic to a TLS service listening at this URI.
    #[arg(long, env = "TCPMUX_HTTPS", default_value = "tcp://localhost:443")]
    https: Endpoint,

    /// Forward unrecognized traffic to this URI instead of waiting out
    /// the sniff deadline.
    #[arg(long, env = "TCPMUX_OTHER")]
    other: Option<Endpoint>,

    /// Log per-connection lifecycle and detection events.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins; otherwise --verbose selects the filter.
    let default_filter = if cli.verbose {
        "tcpmux=debug"
    } else {
        "tcpmux=warn"
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        listen = %cli.listen,
        ssh = %cli.ssh,
        https = %cli.https,
        other = %cli.other.as_ref().map(|e| e.to_string()).unwrap_or_else(|| "none".to_string()),
        "Starting tcpmux"
    );

    let backends = Backends::new(cli.ssh, cli.https, cli.other);
    let mux = Arc::new(
        Mux::bind(MuxConfig::new(cli.listen), backends)
            .await
            .context("failed to bind listener")?,
    );
    let stats = mux.stats();

    let accept_loop = tokio::spawn(mux.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = accept_loop => {
            match result {
                Ok(Err(e)) => {
                    error!(error = %e, "Listener failed");
                    return Err(e).context("listener failed");
                }
                Ok(Ok(())) => {}
                Err(e) => return Err(anyhow::Error::from(e).context("accept loop panicked")),
            }
        }
    }

    info!(
        accepted = stats.connections_accepted.load(Ordering::Relaxed),
        closed = stats.connections_closed.load(Ordering::Relaxed),
        detected_https = stats.detected_https.load(Ordering::Relaxed),
        detected_ssh = stats.detected_ssh.load(Ordering::Relaxed),
        detected_other = stats.detected_other.load(Ordering::Relaxed),
        sniff_timeouts = stats.sniff_timeouts.load(Ordering::Relaxed),
        dial_failures = stats.dial_failures.load(Ordering::Relaxed),
        bytes_to_backend = stats.bytes_to_backend.load(Ordering::Relaxed),
        bytes_from_backend = stats.bytes_from_backend.load(Ordering::Relaxed),
        "Shutdown complete"
    );
    Ok(())
}
