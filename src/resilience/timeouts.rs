//! Timeout enforcement.
//!
//! # Responsibilities
//! - Carry a caller's cancellation deadline down to socket operations
//! - Derive a default deadline when the caller has none
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Returned when a deadline passes before the operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct Elapsed;

/// An absolute point in time after which an operation is abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
        }
    }

    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// The caller's deadline if any, otherwise `default` from now.
    pub fn or_default(deadline: Option<Deadline>, default: Duration) -> Self {
        deadline.unwrap_or_else(|| Self::after(default))
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// The earlier of this deadline and `timeout` from now.
    pub fn min_with(&self, timeout: Duration) -> Self {
        let other = Instant::now() + timeout;
        Self {
            at: self.at.min(other),
        }
    }

    /// Run `fut` until this deadline.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        tokio::time::timeout_at(self.at, fut).await.map_err(|_| Elapsed)
    }
}
