//! Idle connection storage.
//!
//! Per-key lists (newest last) plus one least-recently-used ordering across
//! every key, all behind a single read/write lock. Connections are closed
//! outside the lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use super::types::ConnectionKey;
use crate::net::ConnectionId;

/// What the idle pool needs from a connection.
pub trait PooledResource: Send + Sync {
    fn id(&self) -> ConnectionId;
    fn is_alive(&self) -> bool;
    fn close(&self, reason: &'static str);
}

/// Outcome of [`IdleConnectionPool::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Pooled,
    /// Pooled, and the globally oldest idle connection was closed to make room.
    PooledWithEviction(ConnectionId),
    /// Per-key cap reached or connection dead; it was closed.
    Closed,
}

struct Entry<T> {
    key: ConnectionKey,
    conn: Arc<T>,
    since: Instant,
    seq: u64,
}

struct Inner<T> {
    buckets: HashMap<u64, Vec<Entry<T>>>,
    /// seq → bucket, oldest first.
    lru: BTreeMap<u64, u64>,
    next_seq: u64,
    total: usize,
}

impl<T> Inner<T> {
    fn remove_at(&mut self, bucket: u64, index: usize) -> Entry<T> {
        let entries = self.buckets.entry(bucket).or_default();
        let entry = entries.remove(index);
        if entries.is_empty() {
            self.buckets.remove(&bucket);
        }
        self.lru.remove(&entry.seq);
        self.total -= 1;
        entry
    }

    fn pop_oldest(&mut self) -> Option<Entry<T>> {
        let (&seq, &bucket) = self.lru.iter().next()?;
        let index = self.buckets.get(&bucket)?.iter().position(|e| e.seq == seq)?;
        Some(self.remove_at(bucket, index))
    }
}

pub struct IdleConnectionPool<T> {
    inner: RwLock<Inner<T>>,
    max_per_key: usize,
    max_total: usize,
    ttl: Duration,
}

impl<T: PooledResource> IdleConnectionPool<T> {
    pub fn new(max_per_key: usize, max_total: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                buckets: HashMap::new(),
                lru: BTreeMap::new(),
                next_seq: 0,
                total: 0,
            }),
            max_per_key,
            max_total,
            ttl,
        }
    }

    /// Take the most recently idled live connection for `key`. Dead and
    /// expired entries met on the way are dropped and closed.
    pub fn acquire(&self, key: &ConnectionKey) -> Option<Arc<T>> {
        let bucket = key.bucket();
        let mut discarded = Vec::new();
        let found = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            loop {
                let index = inner
                    .buckets
                    .get(&bucket)
                    .and_then(|entries| entries.iter().rposition(|e| &e.key == key));
                let Some(index) = index else { break None };
                let entry = inner.remove_at(bucket, index);
                if !entry.conn.is_alive() {
                    discarded.push((entry.conn, "dead"));
                } else if entry.since.elapsed() >= self.ttl {
                    discarded.push((entry.conn, "idle timeout"));
                } else {
                    break Some(entry.conn);
                }
            }
        };
        for (conn, reason) in discarded {
            tracing::debug!(connection_id = %conn.id(), key = %key, reason, "Dropping idle connection");
            conn.close(reason);
        }
        found
    }

    /// Return `conn` to the idle set.
    pub fn release(&self, key: &ConnectionKey, conn: Arc<T>) -> ReleaseOutcome {
        if !conn.is_alive() {
            return ReleaseOutcome::Closed;
        }
        let bucket = key.bucket();
        let evicted = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let same_key = inner
                .buckets
                .get(&bucket)
                .map(|entries| entries.iter().filter(|e| &e.key == key).count())
                .unwrap_or(0);
            if same_key >= self.max_per_key {
                drop(inner);
                tracing::debug!(connection_id = %conn.id(), key = %key, "Per-key idle cap reached");
                conn.close("per-key idle cap");
                return ReleaseOutcome::Closed;
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.buckets.entry(bucket).or_default().push(Entry {
                key: key.clone(),
                conn,
                since: Instant::now(),
                seq,
            });
            inner.lru.insert(seq, bucket);
            inner.total += 1;

            if inner.total > self.max_total {
                inner.pop_oldest()
            } else {
                None
            }
        };

        match evicted {
            Some(entry) => {
                let id = entry.conn.id();
                tracing::debug!(connection_id = %id, key = %entry.key, "Evicting least recently used idle connection");
                entry.conn.close("evicted");
                ReleaseOutcome::PooledWithEviction(id)
            }
            None => ReleaseOutcome::Pooled,
        }
    }

    /// Close every entry that is dead or past its idle TTL.
    pub fn purge_expired(&self) -> usize {
        let expired = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            let mut stale = Vec::new();
            for (bucket, entries) in &inner.buckets {
                for (index, entry) in entries.iter().enumerate().rev() {
                    if !entry.conn.is_alive() || entry.since.elapsed() >= self.ttl {
                        stale.push((*bucket, index));
                    }
                }
            }
            stale
                .into_iter()
                .map(|(bucket, index)| inner.remove_at(bucket, index))
                .collect::<Vec<_>>()
        };
        for entry in &expired {
            entry.conn.close("idle timeout");
        }
        expired.len()
    }

    pub fn idle_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).total
    }

    pub fn idle_count_for(&self, key: &ConnectionKey) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .buckets
            .get(&key.bucket())
            .map(|entries| entries.iter().filter(|e| &e.key == key).count())
            .unwrap_or(0)
    }

    /// Close everything.
    pub fn clear(&self) {
        let drained: Vec<Arc<T>> = {
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.lru.clear();
            inner.total = 0;
            inner
                .buckets
                .drain()
                .flat_map(|(_, entries)| entries.into_iter().map(|e| e.conn))
                .collect()
        };
        for conn in drained {
            conn.close("pool cleared");
        }
    }
}

impl<T> std::fmt::Debug for IdleConnectionPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdleConnectionPool")
            .field("max_per_key", &self.max_per_key)
            .field("max_total", &self.max_total)
            .field("ttl", &self.ttl)
            .finish()
    }
}
