//! Addresses of the servers which make up a deployment.

use std::sync::Arc;
use thiserror::Error;

/// The port assumed when an address does not name one.
pub const DEFAULT_PORT: u16 = 27017;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("empty server address")]
    Empty,

    #[error("invalid port in server address {0:?}")]
    InvalidPort(String),

    #[error("unterminated IPv6 literal in server address {0:?}")]
    UnterminatedIpv6(String),
}

/// The canonical `host:port` form of a server's address.
///
/// Host names are lower-cased and a missing port is filled in with
/// [DEFAULT_PORT], so two spellings of the same server compare equal.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug)]
pub struct ServerAddress {
    canonical: Arc<str>,
    host_len: usize,
    port: u16,
}

impl ServerAddress {
    /// Parses `host`, `host:port`, `[v6]` or `[v6]:port`.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Empty);
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let Some(end) = rest.find(']') else {
                return Err(Error::UnterminatedIpv6(s.to_string()));
            };
            let host = &s[..end + 2];
            let port = match &rest[end + 1..] {
                "" => None,
                tail => Some(
                    tail.strip_prefix(':')
                        .ok_or_else(|| Error::InvalidPort(s.to_string()))?,
                ),
            };
            (host, port)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() {
            return Err(Error::Empty);
        }
        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| Error::InvalidPort(s.to_string()))?,
            None => DEFAULT_PORT,
        };
        Ok(Self::from_parts(host, port))
    }

    fn from_parts(host: &str, port: u16) -> Self {
        let host = host.to_ascii_lowercase();
        let host_len = host.len();
        Self {
            canonical: format!("{host}:{port}").into(),
            host_len,
            port,
        }
    }

    /// The host, including brackets for IPv6 literals.
    pub fn host(&self) -> &str {
        &self.canonical[..self.host_len]
    }

    /// The host in a form suitable for name resolution (no brackets).
    pub fn resolvable_host(&self) -> &str {
        self.host().trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.canonical.fmt(f)
    }
}

impl std::str::FromStr for ServerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<std::net::SocketAddr> for ServerAddress {
    fn from(addr: std::net::SocketAddr) -> Self {
        match addr {
            std::net::SocketAddr::V4(v4) => Self::from_parts(&v4.ip().to_string(), v4.port()),
            std::net::SocketAddr::V6(v6) => Self::from_parts(&format!("[{}]", v6.ip()), v6.port()),
        }
    }
}

// Hashes exactly like the canonical string, so maps keyed by address can be
// queried with a `&str`.
impl std::hash::Hash for ServerAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state)
    }
}

impl std::borrow::Borrow<str> for ServerAddress {
    fn borrow(&self) -> &str {
        &self.canonical
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.canonical.serialize(serializer)
    }
}
