//! Transparent TLS-intercepting proxy.
//!
//! # Data Flow
//! ```text
//! Listener (net/listener.rs)
//!     → server.rs (sniff, TLS accept, first request)
//!     → destination.rs (Host/SNI → address, loop guard)
//!     → net/dial.rs (origin connection)
//!     → forward splice ─or─ hijack loop with hooks.rs
//! ```
//!
//! # Design Decisions
//! - One task per accepted connection; a failure closes only that connection
//! - The DNS cache and TLS configuration are the only shared state
//! - Requests addressed to the proxy itself get a local page, never a dial

pub mod destination;
pub mod hooks;
pub mod server;

pub use destination::Destination;
pub use hooks::{Hooks, InterceptedExchange};
pub use server::{ProxyError, TransparentProxy};
