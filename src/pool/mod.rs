//! Connection pool.
//!
//! # Data Flow
//! ```text
//! Client::send(key, raw)
//!     → ConnectionPool::acquire(key)
//!         http/1.1: idle.rs hit ─or─ dial → PersistentConnection (connection.rs)
//!         h2:       live H2Connection ─or─ dial + handshake (downgrade to http/1.1 on failure)
//!     → ConnectionPool::execute(conn, raw) → (response bytes, ServerTiming)
//!     → ConnectionPool::release(conn) → idle.rs (per-key cap, global LRU)
//! ```
//!
//! # Design Decisions
//! - HTTP/2 connections never enter the idle set; they stay shared while
//!   usable (no GOAWAY, stream capacity left, not closed)
//! - A failed HTTP/2 handshake is discarded and replaced by a fresh
//!   HTTP/1.1 dial; the caller only sees a log line and a metric
//! - Retry is decided by the caller (`client.rs`), never here

pub mod auth;
pub mod client;
pub mod connection;
pub mod idle;
pub mod types;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time;

use crate::config::{EngineConfig, Http2Config, PoolConfig, TimeoutConfig};
use crate::h2::H2Connection;
use crate::net::{ClientProfiles, ConnectionId, DialTarget, Dialed, Dialer, Resolver, TlsError};
use crate::normalize::ReadLimits;
use crate::observability::metrics;
use crate::resilience::Deadline;

pub use auth::{Authenticator, BasicAuth};
pub use client::Client;
pub use connection::PersistentConnection;
pub use idle::{IdleConnectionPool, PooledResource, ReleaseOutcome};
pub use types::{ConnectionKey, HttpScheme, PoolError, PooledResponse, ServerTiming};

/// The transport behind a [`PooledConnection`].
#[derive(Debug, Clone)]
pub enum Connection {
    Http1(Arc<PersistentConnection>),
    H2(Arc<H2Connection>),
}

/// A connection checked out of the pool.
#[derive(Debug)]
pub struct PooledConnection {
    /// Key the connection is filed under; differs from the requested key
    /// after an HTTP/2 downgrade.
    key: ConnectionKey,
    inner: Connection,
    reused: bool,
}

impl PooledConnection {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn connection(&self) -> &Connection {
        &self.inner
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_http2(&self) -> bool {
        matches!(self.inner, Connection::H2(_))
    }

    pub fn id(&self) -> ConnectionId {
        match &self.inner {
            Connection::Http1(conn) => conn.id(),
            Connection::H2(conn) => conn.id(),
        }
    }
}

pub struct ConnectionPool {
    idle: IdleConnectionPool<PersistentConnection>,
    h2: Mutex<HashMap<ConnectionKey, Vec<Arc<H2Connection>>>>,
    dialer: Dialer,
    pool: PoolConfig,
    http2: Http2Config,
    timeouts: TimeoutConfig,
    limits: ReadLimits,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl ConnectionPool {
    pub fn new(config: &EngineConfig, dialer: Dialer) -> Self {
        Self {
            idle: IdleConnectionPool::new(
                config.pool.max_idle_per_key,
                config.pool.max_idle_total,
                config.pool.idle_ttl(),
            ),
            h2: Mutex::new(HashMap::new()),
            dialer,
            pool: config.pool.clone(),
            http2: config.http2.clone(),
            timeouts: config.timeouts.clone(),
            limits: ReadLimits::from(&config.limits),
            authenticator: None,
        }
    }

    /// Pool with the system resolver and the default client TLS profiles.
    pub fn from_config(config: &EngineConfig) -> Result<Self, TlsError> {
        let dialer = Dialer::new(Resolver::system(&config.dns), ClientProfiles::new()?);
        Ok(Self::new(config, dialer))
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.pool
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.idle_count()
    }

    pub fn idle_count_for(&self, key: &ConnectionKey) -> usize {
        self.idle.idle_count_for(key)
    }

    /// Hand out a live connection for `key`, dialing when none is idle.
    pub async fn acquire(&self, key: &ConnectionKey, deadline: Deadline) -> Result<PooledConnection, PoolError> {
        match key.scheme {
            HttpScheme::H2 => self.acquire_h2(key, deadline).await,
            HttpScheme::Http11 => self.acquire_http11(key, deadline).await,
        }
    }

    async fn acquire_http11(&self, key: &ConnectionKey, deadline: Deadline) -> Result<PooledConnection, PoolError> {
        if let Some(conn) = self.idle.acquire(key) {
            conn.mark_reused();
            metrics::record_pool_hit();
            metrics::set_idle_connections(self.idle.idle_count());
            tracing::trace!(connection_id = %conn.id(), key = %key, "Reusing idle connection");
            return Ok(PooledConnection {
                key: key.clone(),
                inner: Connection::Http1(conn),
                reused: true,
            });
        }

        metrics::record_pool_miss();
        let dialed = self.dial(key, false, deadline).await?;
        let conn = Arc::new(PersistentConnection::new(
            dialed.stream,
            self.authenticator.clone(),
            self.limits,
        ));
        tracing::debug!(connection_id = %conn.id(), key = %key, peer = %dialed.peer, "Dialed new connection");
        Ok(PooledConnection {
            key: key.clone(),
            inner: Connection::Http1(conn),
            reused: false,
        })
    }

    async fn acquire_h2(&self, key: &ConnectionKey, deadline: Deadline) -> Result<PooledConnection, PoolError> {
        if let Some(conn) = self.live_h2(key) {
            metrics::record_pool_hit();
            return Ok(PooledConnection {
                key: key.clone(),
                inner: Connection::H2(conn),
                reused: true,
            });
        }

        metrics::record_pool_miss();
        let dialed = self.dial(key, true, deadline).await?;
        if key.tls && !dialed.negotiated_h2() {
            let alpn = dialed
                .alpn
                .as_deref()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            return self.downgrade(key, &format!("server selected ALPN {alpn:?}"), deadline).await;
        }

        let scheme = if key.tls { "https" } else { "http" };
        match H2Connection::handshake(dialed.stream, &self.http2, scheme, &key.authority(), deadline).await {
            Ok(conn) => {
                let conn = Arc::new(conn);
                tracing::debug!(connection_id = %conn.id(), key = %key, "HTTP/2 connection established");
                self.h2
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .entry(key.clone())
                    .or_default()
                    .push(Arc::clone(&conn));
                Ok(PooledConnection {
                    key: key.clone(),
                    inner: Connection::H2(conn),
                    reused: false,
                })
            }
            Err(e) if e.is_handshake() => self.downgrade(key, &e.to_string(), deadline).await,
            Err(e) => Err(PoolError::Http2(e)),
        }
    }

    /// Usable shared HTTP/2 connection, pruning dead ones.
    fn live_h2(&self, key: &ConnectionKey) -> Option<Arc<H2Connection>> {
        let mut map = self.h2.lock().unwrap_or_else(|e| e.into_inner());
        let conns = map.get_mut(key)?;
        conns.retain(|c| !c.is_closed() && !(c.received_goaway() && c.active_streams() == 0));
        let found = conns.iter().find(|c| c.is_usable()).cloned();
        if conns.is_empty() {
            map.remove(key);
        }
        found
    }

    async fn downgrade(&self, key: &ConnectionKey, reason: &str, deadline: Deadline) -> Result<PooledConnection, PoolError> {
        metrics::record_h2_downgrade();
        tracing::info!(key = %key, reason, "HTTP/2 unavailable, falling back to HTTP/1.1");
        self.acquire_http11(&key.http11(), deadline).await
    }

    async fn dial(&self, key: &ConnectionKey, offer_h2: bool, deadline: Deadline) -> Result<Dialed, PoolError> {
        let target = DialTarget {
            host: &key.host,
            port: key.port,
            tls: key.tls,
            alt_tls: key.alt_tls,
            offer_h2,
            proxies: &key.proxies,
        };
        let connect_deadline = deadline.min_with(Duration::from_secs(self.timeouts.connect_secs));
        Ok(self.dialer.dial(&target, connect_deadline).await?)
    }

    /// Send `raw` on `conn` and wait for the response.
    pub async fn execute(
        &self,
        conn: &PooledConnection,
        raw: Vec<u8>,
        deadline: Deadline,
    ) -> Result<PooledResponse, PoolError> {
        match &conn.inner {
            Connection::Http1(c) => c.execute(raw, deadline).await,
            Connection::H2(c) => {
                let (bytes, timing) = c.send_request(&raw, deadline).await.map_err(|e| match e {
                    crate::h2::H2Error::Timeout => PoolError::Timeout,
                    other => PoolError::Http2(other),
                })?;
                Ok(PooledResponse { bytes, timing })
            }
        }
    }

    /// Give `conn` back. Dead HTTP/1.1 connections are dropped; live ones go
    /// to the idle set, possibly evicting the globally oldest idle entry.
    pub fn release(&self, conn: PooledConnection) {
        let PooledConnection { key, inner, .. } = conn;
        match inner {
            Connection::Http1(c) => {
                if !c.is_alive() || !c.mark_idle() {
                    tracing::trace!(connection_id = %c.id(), reason = ?c.close_reason(), "Not pooling closed connection");
                    return;
                }
                match self.idle.release(&key, c) {
                    ReleaseOutcome::PooledWithEviction(_) => metrics::record_pool_eviction(),
                    ReleaseOutcome::Pooled | ReleaseOutcome::Closed => {}
                }
                metrics::set_idle_connections(self.idle.idle_count());
            }
            Connection::H2(c) => {
                if c.is_closed() || (c.received_goaway() && c.active_streams() == 0) {
                    let mut map = self.h2.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(conns) = map.get_mut(&key) {
                        conns.retain(|other| !Arc::ptr_eq(other, &c));
                        if conns.is_empty() {
                            map.remove(&key);
                        }
                    }
                    drop(map);
                    c.close();
                }
            }
        }
    }

    /// Close idle connections past their TTL.
    pub fn purge_idle(&self) -> usize {
        let purged = self.idle.purge_expired();
        metrics::set_idle_connections(self.idle.idle_count());
        purged
    }

    /// Purge expired idle connections every `pool.purge_interval_secs`
    /// until shutdown is signalled.
    pub async fn run_idle_reaper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = time::interval(self.pool.purge_interval());
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = self.purge_idle();
                    if purged > 0 {
                        tracing::debug!(purged, idle = self.idle_count(), "Purged expired idle connections");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Idle reaper received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Close every pooled connection.
    pub fn shutdown(&self) {
        self.idle.clear();
        let drained: Vec<Arc<H2Connection>> = self
            .h2
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .flat_map(|(_, conns)| conns)
            .collect();
        for conn in drained {
            conn.close();
        }
        metrics::set_idle_connections(0);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("idle", &self.idle)
            .field("pool", &self.pool)
            .field("authenticator", &self.authenticator)
            .finish()
    }
}
