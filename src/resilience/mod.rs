//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Pooled exchange:
//!     → timeouts.rs (caller deadline bounds dial, write and read)
//!     → On failure: retries.rs (reused connection + read failure only)
//! ```
//!
//! # Design Decisions
//! - Every outbound operation has a deadline
//! - Retries never target a connection that was just dialed

pub mod retries;
pub mod timeouts;

pub use retries::RetryPolicy;
pub use timeouts::{Deadline, Elapsed};
