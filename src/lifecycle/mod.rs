//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Ctrl-C / SIGTERM (signals.rs)
//!     → Shutdown::trigger (shutdown.rs)
//!     → proxy accept loop stops → open connections drain
//! ```
//!
//! # Design Decisions
//! - One broadcast channel; late subscribers still see a trigger that already happened
//! - Draining is bounded by the caller, not here

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::wait_for_shutdown_signal;
