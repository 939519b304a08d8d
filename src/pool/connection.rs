//! A pooled HTTP/1.1 connection.
//!
//! # Data Flow
//! ```text
//! execute() ──pending ctx (depth 1)──▶ read task ──peek──▶ read_response ──▶ oneshot
//!     └─────write job (depth 1)──────▶ write task ──▶ socket
//! ```
//!
//! # Design Decisions
//! - The write queue has depth 1, so a second writer waits until the first
//!   write's outcome is known; the read task can meanwhile drain an earlier
//!   response (limited pipelining)
//! - While nothing is outstanding the read task sits in an unbounded peek;
//!   EOF there is a clean idle close, not an error
//! - A closed connection is never revived

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::auth::Authenticator;
use super::idle::PooledResource;
use super::types::{PoolError, PooledResponse, ServerTiming};
use crate::net::{AtomicConnectionState, BoxedStream, ConnectionId, ConnectionState};
use crate::normalize::message::parse;
use crate::normalize::reader::{read_response_with, RawMessage, ReadLimits};
use crate::resilience::Deadline;

struct WriteJob {
    bytes: Vec<u8>,
    done: oneshot::Sender<io::Result<()>>,
}

/// What the read task needs to parse and deliver one response.
struct PendingResponse {
    method: String,
    request: Vec<u8>,
    started: Instant,
    auth_attempted: bool,
    respond: oneshot::Sender<Result<PooledResponse, PoolError>>,
}

struct ConnShared {
    id: ConnectionId,
    state: AtomicConnectionState,
    outstanding: AtomicUsize,
    close_reason: Mutex<Option<&'static str>>,
}

impl ConnShared {
    fn close(&self, reason: &'static str) {
        if self.state.close() {
            *self.close_reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
            tracing::debug!(connection_id = %self.id, reason, "Connection closed");
        }
    }
}

pub struct PersistentConnection {
    shared: Arc<ConnShared>,
    reused: AtomicBool,
    write_tx: mpsc::Sender<WriteJob>,
    pending_tx: mpsc::Sender<PendingResponse>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl PersistentConnection {
    /// Take ownership of a connected stream and start its two tasks.
    /// Responses larger than `limits` fail the request and close the connection.
    pub fn new(
        stream: BoxedStream,
        authenticator: Option<Arc<dyn Authenticator>>,
        limits: ReadLimits,
    ) -> Self {
        let shared = Arc::new(ConnShared {
            id: ConnectionId::new(),
            state: AtomicConnectionState::new(ConnectionState::Fresh),
            outstanding: AtomicUsize::new(0),
            close_reason: Mutex::new(None),
        });
        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::channel(1);
        let (pending_tx, pending_rx) = mpsc::channel(1);

        let writer = tokio::spawn(write_loop(write_half, write_rx, Arc::clone(&shared)));
        let reader = tokio::spawn(read_loop(
            BufReader::new(read_half),
            pending_rx,
            write_tx.clone(),
            Arc::clone(&shared),
            authenticator,
            limits,
        ));

        Self {
            shared,
            reused: AtomicBool::new(false),
            write_tx,
            pending_tx,
            writer,
            reader,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.load()
    }

    pub fn is_reused(&self) -> bool {
        self.reused.load(Ordering::Acquire)
    }

    /// Called by the pool when this connection is handed out from the idle set.
    pub fn mark_reused(&self) {
        self.reused.store(true, Ordering::Release);
    }

    /// Called by the pool when the connection goes back to the idle set.
    pub fn mark_idle(&self) -> bool {
        self.shared.state.transition(ConnectionState::Idle)
    }

    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<&'static str> {
        *self
            .shared
            .close_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn closed_error(&self) -> PoolError {
        if self.is_reused() {
            PoolError::ServerClosedIdle
        } else {
            PoolError::ConnectionClosed
        }
    }

    /// Write `raw` and wait for the matching response.
    pub async fn execute(&self, raw: Vec<u8>, deadline: Deadline) -> Result<PooledResponse, PoolError> {
        if self.shared.state.is_closed() {
            return Err(self.closed_error());
        }
        self.shared.state.transition(ConnectionState::InUse);

        match deadline.run(self.exchange(raw)).await {
            Ok(result) => result,
            Err(_) => {
                PooledResource::close(self, "request timed out");
                Err(PoolError::Timeout)
            }
        }
    }

    async fn exchange(&self, raw: Vec<u8>) -> Result<PooledResponse, PoolError> {
        let method = parse(&raw)
            .and_then(|m| m.method().map(str::to_string))
            .unwrap_or_else(|| "GET".to_string());
        let (respond, response) = oneshot::channel();
        let (done, written) = oneshot::channel();

        self.pending_tx
            .send(PendingResponse {
                method,
                request: raw.clone(),
                started: Instant::now(),
                auth_attempted: false,
                respond,
            })
            .await
            .map_err(|_| self.closed_error())?;
        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);

        self.write_tx
            .send(WriteJob { bytes: raw, done })
            .await
            .map_err(|_| self.closed_error())?;
        match written.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                PooledResource::close(self, "write failed");
                return Err(self.classify_write_error(e));
            }
            Err(_) => return Err(self.closed_error()),
        }

        response.await.map_err(|_| self.closed_error())?
    }

    fn classify_write_error(&self, err: io::Error) -> PoolError {
        let peer_gone = matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
        );
        if self.is_reused() && peer_gone {
            PoolError::ServerClosedIdle
        } else {
            PoolError::Write(err)
        }
    }
}

impl PooledResource for PersistentConnection {
    fn id(&self) -> ConnectionId {
        self.shared.id
    }

    fn is_alive(&self) -> bool {
        !self.shared.state.is_closed()
    }

    fn close(&self, reason: &'static str) {
        self.shared.close(reason);
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for PersistentConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("reused", &self.is_reused())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

async fn write_loop(
    mut io: WriteHalf<BoxedStream>,
    mut jobs: mpsc::Receiver<WriteJob>,
    shared: Arc<ConnShared>,
) {
    while let Some(job) = jobs.recv().await {
        let result = write_flush(&mut io, &job.bytes).await;
        let failed = result.is_err();
        let _ = job.done.send(result);
        if failed {
            shared.close("write failed");
            break;
        }
    }
}

async fn write_flush(io: &mut WriteHalf<BoxedStream>, bytes: &[u8]) -> io::Result<()> {
    io.write_all(bytes).await?;
    io.flush().await
}

async fn read_loop(
    mut reader: BufReader<ReadHalf<BoxedStream>>,
    mut pending: mpsc::Receiver<PendingResponse>,
    writer: mpsc::Sender<WriteJob>,
    shared: Arc<ConnShared>,
    authenticator: Option<Arc<dyn Authenticator>>,
    limits: ReadLimits,
) {
    loop {
        let peeked = reader.fill_buf().await.map(|buf| buf.len());
        let first_byte = Instant::now();
        let outstanding = shared.outstanding.load(Ordering::Acquire);
        match peeked {
            Ok(0) if outstanding == 0 => {
                shared.close("closed by server while idle");
                break;
            }
            Ok(_) if outstanding == 0 => {
                shared.close("unsolicited data from server");
                break;
            }
            Err(_) if outstanding == 0 => {
                shared.close("read error while idle");
                break;
            }
            _ => {}
        }

        let Some(mut ctx) = pending.recv().await else {
            break;
        };

        let mut result = read_response_with(&mut reader, &ctx.method, &limits).await;
        while let Some(auth) = authenticator.as_deref() {
            let retry = match &result {
                Ok(message)
                    if !ctx.auth_attempted
                        && message.status() == Some(401)
                        && !message.connection_close
                        && shared.outstanding.load(Ordering::Acquire) == 1 =>
                {
                    message
                        .head()
                        .header("www-authenticate")
                        .and_then(|challenge| auth.authorize(&ctx.request, challenge))
                }
                _ => None,
            };
            let Some(retry) = retry else {
                break;
            };
            tracing::debug!(connection_id = %shared.id, "Answering authentication challenge");
            ctx.auth_attempted = true;
            ctx.request = retry.clone();
            if let Err(e) = submit(&writer, retry).await {
                result = Err(e);
                break;
            }
            result = read_response_with(&mut reader, &ctx.method, &limits).await;
        }

        match result {
            Ok(message) => {
                if message.connection_close {
                    shared.close("server requested close");
                }
                shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                deliver(ctx, first_byte, message);
                if shared.state.is_closed() {
                    break;
                }
            }
            Err(e) => {
                shared.close("read failed");
                shared.outstanding.fetch_sub(1, Ordering::AcqRel);
                let _ = ctx.respond.send(Err(PoolError::ReadFromServer(e)));
                break;
            }
        }
    }

    shared.close("reader stopped");
    pending.close();
    while let Ok(ctx) = pending.try_recv() {
        let _ = ctx.respond.send(Err(PoolError::ReadFromServer(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed before response",
        ))));
    }
}

async fn submit(writer: &mpsc::Sender<WriteJob>, bytes: Vec<u8>) -> io::Result<()> {
    let (done, written) = oneshot::channel();
    let closed = || io::Error::new(io::ErrorKind::BrokenPipe, "write task stopped");
    writer
        .send(WriteJob { bytes, done })
        .await
        .map_err(|_| closed())?;
    written.await.map_err(|_| closed())?
}

fn deliver(ctx: PendingResponse, first_byte: Instant, message: RawMessage) {
    let timing = ServerTiming {
        time_to_first_byte: first_byte.saturating_duration_since(ctx.started),
        total: ctx.started.elapsed(),
    };
    let _ = ctx.respond.send(Ok(PooledResponse {
        bytes: message.into_raw(),
        timing,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    use crate::pool::auth::BasicAuth;

    fn connection(authenticator: Option<Arc<dyn Authenticator>>) -> (PersistentConnection, DuplexStream) {
        let (client, server) = tokio::io::duplex(1 << 16);
        (
            PersistentConnection::new(Box::new(client), authenticator, ReadLimits::default()),
            server,
        )
    }

    async fn read_request_head(server: &mut DuplexStream) -> String {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            server.read_exact(&mut byte).await.unwrap();
            buf.push(byte[0]);
        }
        String::from_utf8(buf).unwrap()
    }

    fn deadline() -> Deadline {
        Deadline::after(Duration::from_secs(2))
    }

    #[tokio::test]
    async fn executes_sequential_requests() {
        let (conn, mut server) = connection(None);
        tokio::spawn(async move {
            for body in ["one", "two"] {
                read_request_head(&mut server).await;
                let response = format!("HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n{body}");
                server.write_all(response.as_bytes()).await.unwrap();
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let first = conn
            .execute(b"GET /1 HTTP/1.1\r\nHost: a\r\n\r\n".to_vec(), deadline())
            .await
            .unwrap();
        assert!(first.bytes.ends_with(b"one"));
        let second = conn
            .execute(b"GET /2 HTTP/1.1\r\nHost: a\r\n\r\n".to_vec(), deadline())
            .await
            .unwrap();
        assert!(second.bytes.ends_with(b"two"));
        assert!(PooledResource::is_alive(&conn));
        assert_eq!(conn.outstanding(), 0);
    }

    #[tokio::test]
    async fn idle_eof_is_a_clean_close() {
        let (conn, server) = connection(None);
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!PooledResource::is_alive(&conn));
        assert_eq!(conn.close_reason(), Some("closed by server while idle"));

        conn.mark_reused();
        let err = conn
            .execute(b"GET / HTTP/1.1\r\n\r\n".to_vec(), deadline())
            .await
            .unwrap_err();
        assert!(err.is_server_closed_idle());
    }

    #[tokio::test]
    async fn eof_mid_response_is_read_from_server() {
        let (conn, mut server) = connection(None);
        tokio::spawn(async move {
            read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
                .await
                .unwrap();
        });
        let err = conn
            .execute(b"GET / HTTP/1.1\r\n\r\n".to_vec(), deadline())
            .await
            .unwrap_err();
        assert!(err.is_read_from_server());
    }

    #[tokio::test]
    async fn oversized_response_fails_and_closes() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let limits = ReadLimits {
            max_head_bytes: 1024,
            max_body_bytes: 4,
        };
        let conn = PersistentConnection::new(Box::new(client), None, limits);
        tokio::spawn(async move {
            read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 18446744073709551615\r\n\r\nabc")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let err = conn
            .execute(b"GET / HTTP/1.1\r\n\r\n".to_vec(), deadline())
            .await
            .unwrap_err();
        assert!(err.is_read_from_server());
        assert!(!PooledResource::is_alive(&conn));
    }

    #[tokio::test]
    async fn connection_close_response_closes_connection() {
        let (conn, mut server) = connection(None);
        tokio::spawn(async move {
            read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let response = conn
            .execute(b"GET / HTTP/1.1\r\n\r\n".to_vec(), deadline())
            .await
            .unwrap();
        assert!(response.bytes.starts_with(b"HTTP/1.1 200 OK"));
        assert!(!PooledResource::is_alive(&conn));
    }

    #[tokio::test]
    async fn answers_401_once() {
        let (conn, mut server) = connection(Some(Arc::new(BasicAuth::new("u", "p"))));
        let seen = tokio::spawn(async move {
            let first = read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"t\"\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
            let second = read_request_head(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            (first, second)
        });
        let response = conn
            .execute(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n".to_vec(), deadline())
            .await
            .unwrap();
        assert!(response.bytes.ends_with(b"ok"));
        let (first, second) = seen.await.unwrap();
        assert!(!first.contains("Authorization"));
        assert!(second.contains("Authorization: Basic dTpw"));
    }

    #[tokio::test]
    async fn timeout_closes_connection() {
        let (conn, mut server) = connection(None);
        tokio::spawn(async move {
            read_request_head(&mut server).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let err = conn
            .execute(
                b"GET / HTTP/1.1\r\n\r\n".to_vec(),
                Deadline::after(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout));
        assert!(!PooledResource::is_alive(&conn));
    }
}
