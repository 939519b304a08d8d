//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound (proxy):
//!     listener.rs (accept loop, connection limits)
//!     → connection.rs (ID + tracking for shutdown)
//!     → tls.rs (server-side handshake, per-SNI certificate)
//!
//! Outbound (pool, proxy):
//!     dns.rs (lookup contract + TTL cache)
//!     → dial.rs (TCP → proxy CONNECT chain → TLS)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each connection tracked for graceful shutdown
//! - Outbound TLS never verifies peers; the tool talks to test targets

pub mod connection;
pub mod dial;
pub mod dns;
pub mod listener;
pub mod tls;

pub use connection::{AtomicConnectionState, ConnectionId, ConnectionState, ConnectionTracker};
pub use dial::{BoxedStream, DialError, DialTarget, Dialed, Dialer, ProxyHop};
pub use dns::{DnsCache, Lookup, Resolver, SystemLookup};
pub use listener::{ConnectionPermit, Listener, ListenerError};
pub use tls::{CertificateSource, ClientProfiles, PerHostCertificates, StaticCertificate, TlsError};
