//! Protocol detection over the first bytes of a stream.
//!
//! Each chunk read during the sniffing phase is classified in isolation:
//! a signature split across two reads is not recognized and the
//! connection falls through to fallback or timeout handling. The
//! signatures themselves:
//!
//! - TLS: a handshake record header, `0x16` followed by version
//!   `0x03 0x00`..`0x03 0x03` (RFC 6101 A.1). SSLv2 and lower are
//!   rejected (RFC 6176).
//! - SSH: the ASCII banner prefix `SSH-` (RFC 4253 §4.2).

use std::time::Duration;

use super::backend::BackendKind;

/// Per-read deadline while sniffing. Some SSH clients (PuTTY) wait
/// indefinitely for the server to speak first, so silence past this
/// deadline is itself treated as an SSH signal.
pub const DEFAULT_SNIFF_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for the sniffing phase.
#[derive(Debug, Clone)]
pub struct SniffConfig {
    /// Deadline applied to each individual read, re-armed every
    /// iteration. Cumulative sniff time is unbounded.
    pub timeout: Duration,
}

impl Default for SniffConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SNIFF_TIMEOUT,
        }
    }
}

/// Classify one freshly read chunk.
///
/// Returns the backend to route to, or `None` when the chunk is too
/// short to classify (or unclassifiable with no fallback configured)
/// and sniffing must continue.
pub fn classify(chunk: &[u8], has_fallback: bool) -> Option<BackendKind> {
    if chunk.len() < 3 {
        return None;
    }
    if chunk[0] == 0x16 && chunk[1] == 0x03 && chunk[2] <= 0x03 {
        return Some(BackendKind::Https);
    }

    if chunk.len() < 4 {
        return None;
    }
    if &chunk[..4] == b"SSH-" {
        return Some(BackendKind::Ssh);
    }

    if has_fallback {
        return Some(BackendKind::Other);
    }

    None
}
