//! Connection identity, pooled-connection state, and the live-connection
//! count the proxy drains on shutdown.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection number, shown as `conn-N` in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle of a pooled connection: `Fresh → InUse ⇄ Idle → Closed`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Fresh = 0,
    InUse = 1,
    Idle = 2,
    Closed = 3,
}

impl From<u8> for ConnectionState {
    fn from(val: u8) -> Self {
        match val {
            0 => ConnectionState::Fresh,
            1 => ConnectionState::InUse,
            2 => ConnectionState::Idle,
            _ => ConnectionState::Closed,
        }
    }
}

/// [`ConnectionState`] shared between a connection's tasks. `Closed` is
/// absorbing: no transition leaves it.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from(self.0.load(Ordering::Acquire))
    }

    /// Returns false, leaving the state alone, once closed.
    pub fn transition(&self, next: ConnectionState) -> bool {
        let closed = ConnectionState::Closed as u8;
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != closed).then_some(next as u8)
            })
            .is_ok()
    }

    /// True for the caller that actually closed it.
    pub fn close(&self) -> bool {
        self.0.swap(ConnectionState::Closed as u8, Ordering::AcqRel) != ConnectionState::Closed as u8
    }

    pub fn is_closed(&self) -> bool {
        self.load() == ConnectionState::Closed
    }
}

#[derive(Debug, Default)]
struct Live {
    count: AtomicU64,
    drained: Notify,
}

/// Counts intercepted connections still being served.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<Live>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection until the returned guard drops.
    pub fn track(&self) -> ConnectionGuard {
        self.live.count.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            live: Arc::clone(&self.live),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.live.count.load(Ordering::SeqCst)
    }

    /// Resolve once no tracked connection remains.
    pub async fn wait_for_drain(&self) {
        loop {
            let drained = self.live.drained.notified();
            if self.active_count() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// One tracked connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Arc<Live>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.live.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.live.drained.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Connection finished");
    }
}
