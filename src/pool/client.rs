//! Request sending on top of the pool.

use std::sync::Arc;

use super::types::{ConnectionKey, PoolError, PooledResponse};
use super::ConnectionPool;
use crate::normalize::framing::fix_framing;
use crate::observability::metrics;
use crate::resilience::{Deadline, RetryPolicy};

/// Fix, send and retry raw requests.
#[derive(Debug, Clone)]
pub struct Client {
    pool: Arc<ConnectionPool>,
    retry: RetryPolicy,
    fix_requests: bool,
    preserve_length: bool,
}

impl Client {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let retry = RetryPolicy::new(pool.config().max_retries);
        Self {
            pool,
            retry,
            fix_requests: true,
            preserve_length: false,
        }
    }

    /// Send requests byte-for-byte instead of normalizing them first.
    pub fn raw(mut self) -> Self {
        self.fix_requests = false;
        self
    }

    /// Normalize framing but never synthesize a Content-Length.
    pub fn preserve_length(mut self, preserve: bool) -> Self {
        self.preserve_length = preserve;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Send one request. Failures on connections reused from the idle set
    /// are retried on a fresh acquire; a new connection's failure is final.
    pub async fn send(
        &self,
        key: &ConnectionKey,
        raw: &[u8],
        deadline: Option<Deadline>,
    ) -> Result<PooledResponse, PoolError> {
        let deadline = Deadline::or_default(deadline, self.pool.request_timeout());
        let request = if self.fix_requests {
            fix_framing(raw, self.preserve_length)
        } else {
            raw.to_vec()
        };

        let mut attempt = 0;
        loop {
            let conn = self.pool.acquire(key, deadline).await?;
            let reused = conn.is_reused();
            match self.pool.execute(&conn, request.clone(), deadline).await {
                Ok(response) => {
                    self.pool.release(conn);
                    return Ok(response);
                }
                Err(err) => {
                    let id = conn.id();
                    self.pool.release(conn);
                    if !self.retry.should_retry(attempt, reused, &err) {
                        return Err(err);
                    }
                    attempt += 1;
                    metrics::record_pool_retry();
                    tracing::debug!(connection_id = %id, key = %key, attempt, error = %err, "Retrying on a new connection");
                }
            }
        }
    }
}
