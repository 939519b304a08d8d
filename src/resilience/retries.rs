//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether a failed exchange may be retried
//! - Enforce a retry budget per request
//!
//! # Design Decisions
//! - Only connections reused from the idle pool are retried
//! - Only read-from-server and server-closed-idle failures qualify
//! - A fresh connection's failure is final, so a dead endpoint never loops

use crate::pool::PoolError;

/// Caller-visible retry rule for pooled exchanges.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a failure on a connection with the given `reused` flag is retryable.
    pub fn is_retryable(reused: bool, err: &PoolError) -> bool {
        reused && (err.is_read_from_server() || err.is_server_closed_idle())
    }

    /// Same as [`is_retryable`](Self::is_retryable), bounded by the budget.
    pub fn should_retry(&self, attempt: u32, reused: bool, err: &PoolError) -> bool {
        attempt < self.max_retries && Self::is_retryable(reused, err)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2)
    }
}
