//! Endpoint configuration.
//!
//! Endpoints are given as URIs whose scheme selects the transport:
//! `tcp://host:port` for a network socket, `unix:///path/to/socket` for a
//! local file socket. Parsing happens once at startup; the resulting
//! values are immutable and shared read-only by every session.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Endpoint parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// URI has no `scheme://` separator.
    #[error("endpoint `{0}` is not a URI (expected tcp://host:port or unix:///path)")]
    NotAUri(String),

    /// URI scheme is not one we can listen or dial on.
    #[error("unsupported scheme `{0}` (schemes available are tcp, unix)")]
    UnsupportedScheme(String),

    /// `tcp` URI with an empty authority.
    #[error("tcp URI `{0}` must carry host:port")]
    MissingAuthority(String),

    /// `unix` URI with a non-empty host component.
    #[error("unix URI `{0}` must have a blank host, e.g. unix:///path/to/socket")]
    NonEmptyHost(String),

    /// `unix` URI with no socket path.
    #[error("unix URI `{0}` must carry a socket path")]
    MissingPath(String),
}

/// Transport family of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// TCP network socket.
    Tcp,
    /// Unix domain (file) socket.
    Unix,
}

impl Family {
    fn scheme(self) -> &'static str {
        match self {
            Family::Tcp => "tcp",
            Family::Unix => "unix",
        }
    }
}

/// An immutable (family, address) pair naming somewhere to listen or dial.
///
/// For [`Family::Tcp`] the address is `host:port`; for [`Family::Unix`]
/// it is a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub family: Family,
    pub address: String,
}

impl Endpoint {
    /// TCP endpoint from a `host:port` address.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            family: Family::Tcp,
            address: address.into(),
        }
    }

    /// Unix-socket endpoint from a filesystem path.
    pub fn unix(path: impl Into<String>) -> Self {
        Self {
            family: Family::Unix,
            address: path.into(),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once("://")
            .ok_or_else(|| ConfigError::NotAUri(s.to_string()))?;

        match scheme {
            "tcp" => {
                if rest.is_empty() {
                    return Err(ConfigError::MissingAuthority(s.to_string()));
                }
                Ok(Endpoint::tcp(rest))
            }
            "unix" => {
                // unix:///path parses to an empty host and an absolute path.
                // A non-empty host (unix://host/path) is ambiguous: reject it.
                if !rest.starts_with('/') {
                    if rest.is_empty() {
                        return Err(ConfigError::MissingPath(s.to_string()));
                    }
                    return Err(ConfigError::NonEmptyHost(s.to_string()));
                }
                Ok(Endpoint::unix(rest))
            }
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.family.scheme(), self.address)
    }
}
