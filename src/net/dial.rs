//! Outbound dialing: TCP, TLS, and tunnels through chains of HTTP proxies.
//!
//! ```text
//! resolve(first hop) → TCP connect
//!     → for each proxy hop: CONNECT next-hop:port, expect 2xx
//!     → optional TLS (permissive verifier, ALPN offer)
//! ```
//! Every step runs under the caller's [`Deadline`].

use std::fmt;
use std::io;
use std::net::SocketAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use url::Url;

use super::dns::Resolver;
use super::tls::{ClientProfiles, ALPN_H2};
use crate::normalize::message::{find_header_end, parse};
use crate::resilience::Deadline;

/// Byte stream a dial produces: plain TCP or TLS over it.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Type-erased [`AsyncStream`], so TCP and TLS connections share one type.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Error type for dialing.
#[derive(Debug, Error)]
pub enum DialError {
    /// The first hop's name did not resolve.
    #[error("Failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error("Failed to connect to {addr}: {source}")]
    Connect { addr: SocketAddr, source: io::Error },
    #[error("TLS handshake with {host} failed: {source}")]
    Tls { host: String, source: io::Error },
    /// The host cannot be used as SNI.
    #[error("Invalid TLS server name: {0}")]
    InvalidServerName(String),
    /// CONNECT answered with a non-2xx status, or the connection dropped
    /// before the tunnel was up.
    #[error("Proxy {hop} refused tunnel: {reason}")]
    Proxy { hop: String, reason: String },
    #[error("Invalid proxy URL {url}: {reason}")]
    InvalidProxy { url: String, reason: String },
    /// The caller's deadline passed before the stream was ready.
    #[error("Dial timed out")]
    Timeout,
}

/// One `http://[user:pass@]host:port` hop of a proxy chain.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyHop {
    pub host: String,
    pub port: u16,
    /// Sent as `Proxy-Authorization: Basic` on CONNECT.
    credentials: Option<(String, String)>,
}

impl ProxyHop {
    /// Parse a proxy URL. Only `http://` is accepted; the port defaults to 80.
    pub fn parse(input: &str) -> Result<Self, DialError> {
        let invalid = |reason: &str| DialError::InvalidProxy {
            url: input.to_string(),
            reason: reason.to_string(),
        };
        let url = Url::parse(input).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" {
            return Err(invalid("only http:// proxies are supported"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url.port_or_known_default().unwrap_or(8080);
        let credentials = if url.username().is_empty() {
            None
        } else {
            Some((
                url.username().to_string(),
                url.password().unwrap_or_default().to_string(),
            ))
        };
        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            credentials,
        })
    }

    fn proxy_authorization(&self) -> Option<String> {
        self.credentials.as_ref().map(|(user, pass)| {
            format!("Basic {}", BASE64.encode(format!("{user}:{pass}")))
        })
    }
}

// Credentials stay out of logs.
impl fmt::Display for ProxyHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ProxyHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Where and how to dial.
#[derive(Debug, Clone, Copy)]
pub struct DialTarget<'a> {
    pub host: &'a str,
    pub port: u16,
    pub tls: bool,
    pub alt_tls: bool,
    /// Offer `h2` via ALPN.
    pub offer_h2: bool,
    pub proxies: &'a [ProxyHop],
}

/// A connected stream.
pub struct Dialed {
    pub stream: BoxedStream,
    /// ALPN protocol the server selected, if TLS.
    pub alpn: Option<Vec<u8>>,
    /// Address of the first hop.
    pub peer: SocketAddr,
}

impl Dialed {
    /// Whether the server selected `h2` during the TLS handshake.
    pub fn negotiated_h2(&self) -> bool {
        self.alpn.as_deref() == Some(ALPN_H2)
    }
}

impl fmt::Debug for Dialed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialed")
            .field("alpn", &self.alpn.as_deref().map(String::from_utf8_lossy))
            .field("peer", &self.peer)
            .finish()
    }
}

/// Opens outbound connections.
///
/// Resolution goes through the shared [`Resolver`] cache; TLS uses the
/// permissive client profiles from [`ClientProfiles`].
#[derive(Debug, Clone)]
pub struct Dialer {
    resolver: Resolver,
    profiles: ClientProfiles,
}

impl Dialer {
    pub fn new(resolver: Resolver, profiles: ClientProfiles) -> Self {
        Self { resolver, profiles }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Dial `target`, tunnelling through its proxy chain.
    pub async fn dial(&self, target: &DialTarget<'_>, deadline: Deadline) -> Result<Dialed, DialError> {
        deadline
            .run(self.dial_inner(target))
            .await
            .map_err(|_| DialError::Timeout)?
    }

    async fn dial_inner(&self, target: &DialTarget<'_>) -> Result<Dialed, DialError> {
        let (first_host, first_port) = match target.proxies.first() {
            Some(hop) => (hop.host.as_str(), hop.port),
            None => (target.host, target.port),
        };
        let addr = self
            .resolver
            .resolve_addr(first_host, first_port)
            .await
            .map_err(|source| DialError::Resolve {
                host: first_host.to_string(),
                source,
            })?;
        let mut tcp = connect_tcp(addr).await?;

        for (i, hop) in target.proxies.iter().enumerate() {
            let (next_host, next_port) = match target.proxies.get(i + 1) {
                Some(next) => (next.host.as_str(), next.port),
                None => (target.host, target.port),
            };
            tunnel(&mut tcp, hop, next_host, next_port).await?;
            tracing::trace!(hop = %hop, next_host, next_port, "Tunnel established");
        }

        if !target.tls {
            return Ok(Dialed {
                stream: Box::new(tcp),
                alpn: None,
                peer: addr,
            });
        }

        let (stream, alpn) = self
            .wrap_tls(tcp, target.host, target.alt_tls, target.offer_h2)
            .await?;
        Ok(Dialed {
            stream,
            alpn,
            peer: addr,
        })
    }

    /// Dial a resolved address directly, without proxies.
    pub async fn dial_addr(
        &self,
        addr: SocketAddr,
        server_name: &str,
        tls: bool,
        deadline: Deadline,
    ) -> Result<Dialed, DialError> {
        deadline
            .run(self.dial_addr_inner(addr, server_name, tls))
            .await
            .map_err(|_| DialError::Timeout)?
    }

    async fn dial_addr_inner(
        &self,
        addr: SocketAddr,
        server_name: &str,
        tls: bool,
    ) -> Result<Dialed, DialError> {
        let tcp = connect_tcp(addr).await?;
        if !tls {
            return Ok(Dialed {
                stream: Box::new(tcp),
                alpn: None,
                peer: addr,
            });
        }
        let (stream, alpn) = self.wrap_tls(tcp, server_name, false, false).await?;
        Ok(Dialed {
            stream,
            alpn,
            peer: addr,
        })
    }

    async fn wrap_tls(
        &self,
        tcp: TcpStream,
        host: &str,
        alt_tls: bool,
        offer_h2: bool,
    ) -> Result<(BoxedStream, Option<Vec<u8>>), DialError> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let name = ServerName::try_from(bare.to_string())
            .map_err(|_| DialError::InvalidServerName(host.to_string()))?;
        let connector = TlsConnector::from(self.profiles.select(alt_tls, offer_h2));
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|source| DialError::Tls {
                host: host.to_string(),
                source,
            })?;
        let alpn = tls.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        Ok((Box::new(tls), alpn))
    }
}

async fn connect_tcp(addr: SocketAddr) -> Result<TcpStream, DialError> {
    let tcp = TcpStream::connect(addr)
        .await
        .map_err(|source| DialError::Connect { addr, source })?;
    let _ = tcp.set_nodelay(true);
    Ok(tcp)
}

/// Issue `CONNECT host:port` on `stream` and consume the proxy's answer.
async fn tunnel<S>(stream: &mut S, hop: &ProxyHop, host: &str, port: u16) -> Result<(), DialError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let refused = |reason: String| DialError::Proxy {
        hop: hop.to_string(),
        reason,
    };
    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = hop.proxy_authorization() {
        request.push_str("Proxy-Authorization: ");
        request.push_str(&auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| refused(e.to_string()))?;

    // Byte-at-a-time so nothing past the proxy's head is consumed.
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while find_header_end(&head).is_none() {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| refused(e.to_string()))?;
        if n == 0 {
            return Err(refused("connection closed during CONNECT".to_string()));
        }
        head.push(byte[0]);
        if head.len() > 16 * 1024 {
            return Err(refused("oversized CONNECT response".to_string()));
        }
    }

    let status = parse(&head).and_then(|m| m.status());
    match status {
        Some(s) if (200..300).contains(&s) => Ok(()),
        Some(s) => Err(refused(format!("status {s}"))),
        None => Err(refused("unparseable response".to_string())),
    }
}
