//! Protocol-sniffing TCP multiplexer.
//!
//! This module provides:
//! - The accept loop and per-mux statistics
//! - First-bytes protocol detection (TLS vs. SSH, optional catch-all)
//! - Backend dialing over TCP or Unix sockets
//! - Bidirectional connection relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Mux (accept) -> Session (sniff -> decide -> dial -> replay)
//!                                |
//!                                v
//!                          Relay Engine <-> Backend (ssh | https | other)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use tcpmux::{Backends, Endpoint, Mux, MuxConfig};
//!
//! let backends = Backends::new(
//!     "tcp://localhost:22".parse()?,
//!     "tcp://localhost:443".parse()?,
//!     None,
//! );
//! let config = MuxConfig::new("tcp://0.0.0.0:4444".parse()?);
//! let mux = Arc::new(Mux::bind(config, backends).await?);
//! mux.run().await?;
//! ```

mod backend;
mod listener;
mod relay;
mod session;
mod sniff;

pub use backend::{BackendKind, Backends, MuxListener, Stream, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{Mux, MuxConfig, MuxStats};
pub use relay::{BUFFER_SIZE, RELAY_IDLE_TIMEOUT};
pub use session::Session;
pub use sniff::{classify, SniffConfig, DEFAULT_SNIFF_TIMEOUT};
