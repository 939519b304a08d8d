//! Mock origins for integration tests, built on raw `TcpListener`s.

#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hpack::{Decoder, Encoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use rawhttp::config::{DnsConfig, EngineConfig};
use rawhttp::h2::frame::{self, flags, FrameKind};
use rawhttp::net::{ClientProfiles, DnsCache, Dialer, Lookup, Resolver};
use rawhttp::normalize::reader::read_request;

/// What a programmable backend does with one request.
pub enum Reply {
    /// Write these bytes and keep the connection.
    Respond(Vec<u8>),
    /// Write these bytes and close.
    RespondAndClose(Vec<u8>),
    /// Close without answering.
    Drop,
}

/// A running mock origin.
#[derive(Clone)]
pub struct Backend {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl Backend {
    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Keep-alive origin. `handler(connection_index, request_index, raw_request)`
/// decides every reply.
pub async fn start_backend<F>(handler: F) -> Backend
where
    F: Fn(usize, usize, &[u8]) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(handler);

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let conn_index = counter.fetch_add(1, Ordering::SeqCst);
            let handler = handler.clone();
            tokio::spawn(async move {
                let mut socket = BufReader::new(socket);
                let mut request_index = 0;
                while let Ok(Some(request)) = read_request(&mut socket).await {
                    let reply = if request.method() == Some("PRI") {
                        Reply::RespondAndClose(
                            b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n".to_vec(),
                        )
                    } else {
                        handler(conn_index, request_index, &request.raw)
                    };
                    request_index += 1;
                    match reply {
                        Reply::Respond(bytes) => {
                            if socket.get_mut().write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Reply::RespondAndClose(bytes) => {
                            let _ = socket.get_mut().write_all(&bytes).await;
                            let _ = socket.get_mut().shutdown().await;
                            break;
                        }
                        Reply::Drop => break,
                    }
                }
            });
        }
    });

    Backend { addr, accepted }
}

pub fn ok(body: &str) -> Vec<u8> {
    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}", body.len(), body).into_bytes()
}

/// Origin that answers every request with its own head as the body.
pub async fn start_echo_backend() -> Backend {
    start_backend(|_, _, raw| {
        let head_end = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|i| i + 4)
            .unwrap_or(raw.len());
        let head = String::from_utf8_lossy(&raw[..head_end]).into_owned();
        Reply::Respond(ok(&head))
    })
    .await
}

/// Prior-knowledge h2c origin answering `200` with body `h2:<path>`.
pub async fn start_h2c_backend() -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_h2c(socket));
        }
    });

    Backend { addr, accepted }
}

async fn serve_h2c(mut socket: TcpStream) -> io::Result<()> {
    let mut preface = [0u8; 24];
    socket.read_exact(&mut preface).await?;
    socket.write_all(&frame::settings(&[])).await?;

    let mut decoder = Decoder::new();
    let mut encoder = Encoder::new();
    loop {
        let frame = frame::read_frame(&mut socket, frame::DEFAULT_MAX_FRAME_SIZE).await?;
        match frame.header.kind {
            FrameKind::Settings if !frame.header.has(flags::ACK) => {
                socket.write_all(&frame::settings_ack()).await?;
            }
            FrameKind::Headers => {
                let fragment = frame.content().unwrap_or_default().to_vec();
                let headers = decoder.decode(&fragment).map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("{e:?}"))
                })?;
                let path = headers
                    .iter()
                    .find(|(n, _)| n == b":path")
                    .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
                    .unwrap_or_default();
                let body = format!("h2:{path}");
                let block = encoder.encode(vec![
                    (&b":status"[..], &b"200"[..]),
                    (&b"content-type"[..], &b"text/plain"[..]),
                ]);
                let stream_id = frame.header.stream_id;
                socket
                    .write_all(&frame::headers(&block, stream_id, false, frame::DEFAULT_MAX_FRAME_SIZE))
                    .await?;
                socket
                    .write_all(&frame::data(stream_id, body.as_bytes(), true))
                    .await?;
            }
            _ => {}
        }
    }
}

/// Resolves every name to loopback.
pub struct LoopbackLookup;

#[async_trait]
impl Lookup for LoopbackLookup {
    async fn lookup(&self, _host: &str, _timeout: Duration, _servers: &[String]) -> io::Result<IpAddr> {
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

pub fn loopback_dialer() -> Dialer {
    let dns = DnsConfig::default();
    let resolver = Resolver::new(
        Arc::new(LoopbackLookup),
        Arc::new(DnsCache::new(Duration::from_secs(60))),
        &dns,
    );
    Dialer::new(resolver, ClientProfiles::new().unwrap())
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.timeouts.connect_secs = 2;
    config.timeouts.request_secs = 5;
    config
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
