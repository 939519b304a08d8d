//! Pool keys, errors and timing.

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::h2::H2Error;
use crate::net::{DialError, ProxyHop};

/// Wire protocol spoken on a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpScheme {
    /// One request at a time per connection; idle connections are pooled.
    Http11,
    /// Multiplexed streams on a shared connection. Falls back to
    /// [`HttpScheme::Http11`] when the server does not negotiate it.
    H2,
}

impl fmt::Display for HttpScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpScheme::Http11 => write!(f, "http/1.1"),
            HttpScheme::H2 => write!(f, "h2"),
        }
    }
}

/// Identity of a reusable connection. Two requests share a connection only
/// when every field matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub scheme: HttpScheme,
    /// Origin host name or IP literal, unbracketed.
    pub host: String,
    pub port: u16,
    /// CONNECT proxies, first hop first.
    pub proxies: Vec<ProxyHop>,
    /// Speak TLS to the origin (through any tunnels).
    pub tls: bool,
    /// TLS 1.2-only client profile.
    pub alt_tls: bool,
}

impl ConnectionKey {
    /// HTTP/1.1 key with no proxies and the default TLS profile.
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            scheme: HttpScheme::Http11,
            host: host.into(),
            port,
            proxies: Vec::new(),
            tls,
            alt_tls: false,
        }
    }

    pub fn with_scheme(mut self, scheme: HttpScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Tunnel through `proxies` in order.
    pub fn with_proxies(mut self, proxies: Vec<ProxyHop>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_alt_tls(mut self, alt_tls: bool) -> Self {
        self.alt_tls = alt_tls;
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Value for `:authority`; the scheme's default port is left out.
    pub fn authority(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            self.address()
        }
    }

    /// Same destination spoken over HTTP/1.1.
    pub fn http11(&self) -> Self {
        self.clone().with_scheme(HttpScheme::Http11)
    }

    /// Stable bucket hash (FNV-1a) so bucket selection does not depend on
    /// the process-random std hasher.
    pub fn bucket(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        let mut feed = |bytes: &[u8]| {
            for b in bytes {
                hash ^= *b as u64;
                hash = hash.wrapping_mul(PRIME);
            }
            hash ^= 0xff;
            hash = hash.wrapping_mul(PRIME);
        };
        feed(self.scheme.to_string().as_bytes());
        feed(self.address().as_bytes());
        for hop in &self.proxies {
            feed(hop.to_string().as_bytes());
        }
        feed(&[self.tls as u8, self.alt_tls as u8]);
        hash
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{} ({})", scheme, self.address(), self.scheme)?;
        if self.alt_tls {
            write!(f, " alt-tls")?;
        }
        for hop in &self.proxies {
            write!(f, " via {}", hop)?;
        }
        Ok(())
    }
}

/// Timing of one exchange as seen from the client side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerTiming {
    /// Request sent to first response byte.
    pub time_to_first_byte: Duration,
    /// Request sent to last response byte.
    pub total: Duration,
}

/// Result of one pooled exchange.
#[derive(Debug, Clone)]
pub struct PooledResponse {
    /// The response exactly as received: head, framing and body.
    pub bytes: Vec<u8>,
    pub timing: ServerTiming,
}

/// Errors from acquiring or using pooled connections.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Resolution or TCP connect failed.
    #[error("Dial failed: {0}")]
    Dial(DialError),
    #[error("TLS failed: {0}")]
    Tls(DialError),
    /// A hop in the proxy chain was unreachable or refused CONNECT.
    #[error("Proxy tunnel failed: {0}")]
    Proxy(DialError),
    #[error("Failed to write request: {0}")]
    Write(io::Error),
    /// The server failed or cut the connection while a response was expected.
    #[error("Failed to read response from server: {0}")]
    ReadFromServer(io::Error),
    /// The server had already closed the (idle) connection before we used it.
    #[error("Server closed idle connection")]
    ServerClosedIdle,
    /// The dial or the exchange outlived its deadline.
    #[error("Request timed out")]
    Timeout,
    #[error(transparent)]
    Http2(#[from] H2Error),
    /// The connection was closed locally before the exchange finished.
    #[error("Connection closed")]
    ConnectionClosed,
}

impl PoolError {
    /// Together with [`is_server_closed_idle`](Self::is_server_closed_idle),
    /// the failures a reused connection may retry.
    pub fn is_read_from_server(&self) -> bool {
        matches!(self, PoolError::ReadFromServer(_))
    }

    pub fn is_server_closed_idle(&self) -> bool {
        matches!(self, PoolError::ServerClosedIdle)
    }
}

impl From<DialError> for PoolError {
    fn from(err: DialError) -> Self {
        match err {
            DialError::Tls { .. } | DialError::InvalidServerName(_) => PoolError::Tls(err),
            DialError::Proxy { .. } | DialError::InvalidProxy { .. } => PoolError::Proxy(err),
            DialError::Timeout => PoolError::Timeout,
            other => PoolError::Dial(other),
        }
    }
}
