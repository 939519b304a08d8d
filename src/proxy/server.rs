//! Accept loop and per-connection state machine.
//!
//! ```text
//! sniff (peek 1 byte) ─0x16─▶ TLS handshake (SNI) ─┐
//!        └──────other──────────────────────────────┴▶ read first request (tee)
//!     → destination (Host / SNI) → DNS → loop guard ─self─▶ fallback page
//!     → dial origin
//!     → forward: replay first request, then splice both ways
//!     → hijack:  per exchange: rewrite request → origin → rewrite response → client, mirror
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use super::destination::{fallback_response, targets_proxy, Destination};
use super::hooks::{Hooks, InterceptedExchange};
use crate::config::{EngineConfig, ProxyMode};
use crate::lifecycle::Shutdown;
use crate::net::{BoxedStream, ConnectionId, ConnectionTracker, DialError, Dialer, Listener, ListenerError};
use crate::normalize::message::parse;
use crate::normalize::reader::{read_request_with, read_response_with, RawMessage, ReadLimits};
use crate::observability::metrics;
use crate::resilience::Deadline;

const TLS_HANDSHAKE_RECORD: u8 = 0x16;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("TLS handshake with client failed: {0}")]
    ClientTls(io::Error),
    #[error("Client sent TLS but no certificate source is configured")]
    TlsNotConfigured,
    #[error("Request names no destination")]
    NoDestination,
    #[error("Failed to resolve {host}: {source}")]
    Resolve { host: String, source: io::Error },
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
}

/// Transparent TLS-intercepting proxy.
pub struct TransparentProxy {
    config: Arc<EngineConfig>,
    dialer: Arc<Dialer>,
    acceptor: Option<TlsAcceptor>,
    hooks: Hooks,
    tracker: ConnectionTracker,
    limits: ReadLimits,
}

impl TransparentProxy {
    pub fn new(config: Arc<EngineConfig>, dialer: Arc<Dialer>) -> Self {
        Self {
            limits: ReadLimits::from(&config.limits),
            config,
            dialer,
            acceptor: None,
            hooks: Hooks::default(),
            tracker: ConnectionTracker::new(),
        }
    }

    /// Terminate client TLS with certificates from `server_config`.
    pub fn with_tls(mut self, server_config: Arc<ServerConfig>) -> Self {
        self.acceptor = Some(TlsAcceptor::from(server_config));
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept until `shutdown` fires. Each connection runs in its own task;
    /// a failure there is logged and closes only that connection.
    pub async fn run(self: Arc<Self>, listener: Listener, shutdown: Shutdown) -> Result<(), ListenerError> {
        let local = listener.local_addr().map_err(ListenerError::Accept)?;
        tracing::info!(address = %local, mode = ?self.config.proxy.mode, "Transparent proxy listening");

        loop {
            if shutdown.is_triggered() {
                break;
            }
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let proxy = Arc::clone(&self);
            let guard = self.tracker.track();
            tokio::spawn(async move {
                let _permit = permit;
                let id = guard.id();
                tracing::debug!(connection_id = %id, peer = %peer, "Accepted connection");
                if let Err(e) = proxy.handle(id, stream, local).await {
                    tracing::warn!(connection_id = %id, peer = %peer, error = %e, "Connection failed");
                }
                drop(guard);
            });
        }

        tracing::info!(active = self.tracker.active_count(), "Proxy stopped accepting");
        Ok(())
    }

    /// Drive one accepted connection to completion. `local` is the
    /// listener's bound address.
    pub async fn handle(&self, id: ConnectionId, stream: TcpStream, local: SocketAddr) -> Result<(), ProxyError> {
        let _ = stream.set_nodelay(true);
        let accepted = stream.local_addr().unwrap_or(local);
        let mut first = [0u8; 1];
        if stream.peek(&mut first).await? == 0 {
            return Ok(());
        }

        let is_https = first[0] == TLS_HANDSHAKE_RECORD;
        metrics::record_proxy_connection(is_https);
        let (client, sni): (BoxedStream, Option<String>) = if is_https {
            let acceptor = self.acceptor.as_ref().ok_or(ProxyError::TlsNotConfigured)?;
            let tls = acceptor.accept(stream).await.map_err(ProxyError::ClientTls)?;
            let sni = tls.get_ref().1.server_name().map(str::to_string);
            tracing::debug!(connection_id = %id, sni = ?sni, "Client TLS established");
            (Box::new(tls), sni)
        } else {
            (Box::new(stream), None)
        };

        let mut client = BufReader::new(client);
        let request_timeout = Duration::from_secs(self.config.timeouts.request_secs);
        let Some(request) = Deadline::after(request_timeout)
            .run(read_request_with(&mut client, &self.limits))
            .await
            .map_err(|_| ProxyError::Timeout("first request"))??
        else {
            return Ok(());
        };

        let destination = Destination::from_request(request.head(), sni.as_deref(), is_https, &self.config.proxy)
            .ok_or(ProxyError::NoDestination)?;
        let addr = self
            .dialer
            .resolver()
            .resolve_addr(&destination.host, destination.port)
            .await
            .map_err(|source| ProxyError::Resolve {
                host: destination.host.clone(),
                source,
            })?;

        if targets_proxy(addr, local, accepted).await {
            tracing::debug!(connection_id = %id, target = %addr, "Request addressed to the proxy itself");
            let page = fallback_response(&self.config.proxy.fallback_body);
            client.get_mut().write_all(&page).await?;
            client.get_mut().shutdown().await?;
            return Ok(());
        }

        let connect = Deadline::after(Duration::from_secs(self.config.timeouts.connect_secs));
        let upstream = self
            .dialer
            .dial_addr(addr, &destination.host, destination.tls, connect)
            .await?;
        tracing::debug!(
            connection_id = %id,
            host = %destination.host,
            target = %addr,
            tls = destination.tls,
            "Connected to origin"
        );

        match self.config.proxy.mode {
            ProxyMode::Forward => self.forward(client, upstream.stream, request).await,
            ProxyMode::Hijack => self.hijack(id, client, upstream.stream, request, is_https).await,
        }
    }

    async fn forward(
        &self,
        mut client: BufReader<BoxedStream>,
        mut upstream: BoxedStream,
        first: RawMessage,
    ) -> Result<(), ProxyError> {
        metrics::record_proxy_exchange("forward");
        upstream.write_all(&first.raw).await?;
        // Bytes the client already sent past the first request.
        let buffered = client.buffer().to_vec();
        if !buffered.is_empty() {
            upstream.write_all(&buffered).await?;
        }
        upstream.flush().await?;

        let mut client = client.into_inner();
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((to_origin, to_client)) => {
                tracing::trace!(to_origin, to_client, "Splice finished");
                Ok(())
            }
            Err(e) if is_disconnect(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn hijack(
        &self,
        id: ConnectionId,
        mut client: BufReader<BoxedStream>,
        upstream: BoxedStream,
        first: RawMessage,
        is_https: bool,
    ) -> Result<(), ProxyError> {
        let mut upstream = BufReader::new(upstream);
        let request_timeout = Duration::from_secs(self.config.timeouts.request_secs);
        let mut next = Some(first);

        while let Some(request) = next.take() {
            let original = request.into_raw();
            let outgoing = self.hooks.rewrite_request(is_https, &original);
            let method = parse(&outgoing)
                .and_then(|m| m.method().map(str::to_string))
                .unwrap_or_else(|| "GET".to_string());

            upstream.get_mut().write_all(&outgoing).await?;
            upstream.get_mut().flush().await?;
            let response = Deadline::after(request_timeout)
                .run(read_response_with(&mut upstream, &method, &self.limits))
                .await
                .map_err(|_| ProxyError::Timeout("origin response"))??;
            let close = response.connection_close;
            let received = response.into_raw();

            let delivered = self.hooks.rewrite_response(is_https, &received);
            client.get_mut().write_all(&delivered).await?;
            client.get_mut().flush().await?;
            metrics::record_proxy_exchange("hijack");

            let hijacked = outgoing != original || delivered != received;
            tracing::trace!(connection_id = %id, hijacked, "Exchange complete");
            self.hooks.mirror_exchange(InterceptedExchange {
                id: Uuid::new_v4(),
                request: original,
                response: received,
                is_https,
                hijacked,
            });

            if close {
                break;
            }
            if !skip_noise(&mut client).await? {
                break;
            }
            next = match read_request_with(&mut client, &self.limits).await {
                Ok(request) => request,
                Err(e) if is_disconnect(&e) => None,
                Err(e) => return Err(e.into()),
            };
        }

        let _ = client.get_mut().shutdown().await;
        Ok(())
    }
}

impl std::fmt::Debug for TransparentProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransparentProxy")
            .field("mode", &self.config.proxy.mode)
            .field("tls", &self.acceptor.is_some())
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Discard bytes that cannot start a request line. Returns `false` on EOF.
async fn skip_noise(client: &mut BufReader<BoxedStream>) -> io::Result<bool> {
    loop {
        let buf = match client.fill_buf().await {
            Ok(buf) => buf,
            Err(e) if is_disconnect(&e) => return Ok(false),
            Err(e) => return Err(e),
        };
        let Some(&byte) = buf.first() else {
            return Ok(false);
        };
        if byte.is_ascii_alphabetic() {
            return Ok(true);
        }
        client.consume(1);
    }
}

fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noise_before_request_is_discarded() {
        let (client, mut peer) = tokio::io::duplex(1024);
        peer.write_all(b"\r\n\r\n  GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut reader: BufReader<BoxedStream> = BufReader::new(Box::new(client));
        assert!(skip_noise(&mut reader).await.unwrap());
        let request = read_request_with(&mut reader, &ReadLimits::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.method(), Some("GET"));
    }

    #[tokio::test]
    async fn noise_then_eof_ends_connection() {
        let (client, mut peer) = tokio::io::duplex(1024);
        peer.write_all(b"\r\n").await.unwrap();
        drop(peer);
        let mut reader: BufReader<BoxedStream> = BufReader::new(Box::new(client));
        assert!(!skip_noise(&mut reader).await.unwrap());
    }
}
