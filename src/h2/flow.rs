//! Outbound flow-control credit.
//!
//! The sole back-pressure mechanism for DATA: a writer takes credit before
//! sending and waits while the window is exhausted; WINDOW_UPDATE adds
//! credit and wakes waiters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use super::H2Error;

/// Signed window. SETTINGS changes may drive it negative.
#[derive(Debug)]
pub struct FlowWindow {
    credit: Mutex<i64>,
    changed: Notify,
    closed: AtomicBool,
}

impl FlowWindow {
    pub fn new(initial: i64) -> Self {
        Self {
            credit: Mutex::new(initial),
            changed: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn available(&self) -> i64 {
        *self.credit.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take up to `want` bytes of credit, waiting until some is available.
    pub async fn acquire(&self, want: usize) -> Result<usize, H2Error> {
        if want == 0 {
            return Ok(0);
        }
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before checking so a release between check and await is not lost.
            notified.as_mut().enable();
            {
                if self.closed.load(Ordering::Acquire) {
                    return Err(H2Error::ConnectionClosed);
                }
                let mut credit = self.credit.lock().unwrap_or_else(|e| e.into_inner());
                if *credit > 0 {
                    let granted = (*credit).min(want as i64);
                    *credit -= granted;
                    return Ok(granted as usize);
                }
            }
            notified.await;
        }
    }

    /// Add credit (WINDOW_UPDATE or an unused grant being returned).
    pub fn release(&self, amount: i64) -> Result<(), H2Error> {
        let mut credit = self.credit.lock().unwrap_or_else(|e| e.into_inner());
        let next = *credit + amount;
        if next > i32::MAX as i64 {
            return Err(H2Error::Protocol("flow-control window overflow".to_string()));
        }
        *credit = next;
        drop(credit);
        self.changed.notify_waiters();
        Ok(())
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE delta.
    pub fn adjust(&self, delta: i64) {
        let mut credit = self.credit.lock().unwrap_or_else(|e| e.into_inner());
        *credit += delta;
        drop(credit);
        if delta > 0 {
            self.changed.notify_waiters();
        }
    }

    /// Fail every current and future waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.changed.notify_waiters();
    }
}
