//! rawhttp: a raw HTTP wire engine.
//!
//! - `normalize`: fail-open HTTP/1.x message repair and exact-bytes readers
//! - `pool`: keyed HTTP/1.1 and HTTP/2 connection reuse with retry rules
//! - `h2`: a small frame-level HTTP/2 client
//! - `proxy`: transparent TLS-intercepting proxy with rewrite and mirror hooks

// Core subsystems
pub mod config;
pub mod h2;
pub mod net;
pub mod normalize;
pub mod pool;
pub mod proxy;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::EngineConfig;
pub use lifecycle::Shutdown;
pub use pool::{Client, ConnectionKey, ConnectionPool, HttpScheme};
pub use proxy::{Hooks, TransparentProxy};
