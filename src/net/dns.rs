//! Host name resolution behind a lookup contract, with a TTL cache.
//!
//! # Design Decisions
//! - Resolver internals are external; only [`Lookup`] is consumed
//! - The cache is an explicitly constructed object, never a global
//! - Loopback answers are never cached so local test servers can move

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::config::DnsConfig;

/// `Lookup(hostname, timeout, servers) -> address`.
#[async_trait]
pub trait Lookup: Send + Sync {
    async fn lookup(&self, host: &str, timeout: Duration, servers: &[String]) -> io::Result<IpAddr>;
}

/// Resolves through the operating system.
///
/// The host's resolver configuration always applies; the `servers` argument
/// is only meaningful to custom [`Lookup`] implementations.
/// [`Resolver::system`] warns when it is handed a nameserver list.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup(&self, host: &str, timeout: Duration, _servers: &[String]) -> io::Result<IpAddr> {
        let addrs = tokio::time::timeout(timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "DNS lookup timed out"))??;

        let addrs: Vec<SocketAddr> = addrs.collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .map(|a| a.ip())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}")))
    }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    addr: IpAddr,
    expires_at: Instant,
}

/// Memoized lookups with a bounded lifetime per entry.
#[derive(Debug)]
pub struct DnsCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, host: &str) -> Option<IpAddr> {
        let key = host.to_ascii_lowercase();
        let entry = *self.entries.get(&key)?;
        if Instant::now() >= entry.expires_at {
            self.entries.remove(&key);
            return None;
        }
        Some(entry.addr)
    }

    /// Store an answer. Loopback answers are dropped.
    pub fn insert(&self, host: &str, addr: IpAddr) {
        if addr.is_loopback() || host.eq_ignore_ascii_case("localhost") {
            return;
        }
        self.entries.insert(
            host.to_ascii_lowercase(),
            CacheEntry {
                addr,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Lookup contract plus cache plus the configured timeout and nameservers.
#[derive(Clone)]
pub struct Resolver {
    lookup: Arc<dyn Lookup>,
    cache: Arc<DnsCache>,
    timeout: Duration,
    servers: Vec<String>,
}

impl Resolver {
    pub fn new(lookup: Arc<dyn Lookup>, cache: Arc<DnsCache>, config: &DnsConfig) -> Self {
        Self {
            lookup,
            cache,
            timeout: Duration::from_secs(config.timeout_secs),
            servers: config.servers.clone(),
        }
    }

    /// System lookup with a fresh cache.
    pub fn system(config: &DnsConfig) -> Self {
        if !config.servers.is_empty() {
            tracing::warn!(
                servers = ?config.servers,
                "dns.servers is ignored by the system resolver; the host's configuration applies"
            );
        }
        Self::new(
            Arc::new(SystemLookup),
            Arc::new(DnsCache::new(Duration::from_secs(config.cache_ttl_secs))),
            config,
        )
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Resolve `host` to an address. IP literals are returned without a lookup.
    pub async fn resolve(&self, host: &str) -> io::Result<IpAddr> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return Ok(ip);
        }
        if let Some(ip) = self.cache.get(host) {
            tracing::trace!(host, %ip, "DNS cache hit");
            return Ok(ip);
        }
        let ip = self.lookup.lookup(host, self.timeout, &self.servers).await?;
        tracing::debug!(host, %ip, "Resolved host");
        self.cache.insert(host, ip);
        Ok(ip)
    }

    pub async fn resolve_addr(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        Ok(SocketAddr::new(self.resolve(host).await?, port))
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("cache", &self.cache)
            .field("timeout", &self.timeout)
            .field("servers", &self.servers)
            .finish()
    }
}
