//! Explicit batch scope for outbound notifications.
//!
//! While a scope is open, notifications are collected instead of sent; closing
//! the outermost scope hands them to the dispatcher as a single deferred job.
//! Scopes nest, so an operation can open its own scope without caring whether
//! the caller already has one.

use tracing::debug;

use crate::error::NotificationError;
use crate::ports::{Notification, NotificationDispatcher};

#[derive(Debug, Default)]
pub struct BatchScope {
    depth: u32,
    pending: Vec<Notification>,
}

impl BatchScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) {
        self.depth += 1;
    }

    pub fn is_open(&self) -> bool {
        self.depth > 0
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Send now, or hold until the outermost scope is flushed.
    ///
    /// # Errors
    /// Returns the dispatcher's error when sending immediately.
    pub fn dispatch<N: NotificationDispatcher + ?Sized>(
        &mut self,
        dispatcher: &mut N,
        notification: Notification,
    ) -> Result<(), NotificationError> {
        if self.is_open() {
            self.pending.push(notification);
            Ok(())
        } else {
            dispatcher.send(notification)
        }
    }

    /// Close one level. Closing the outermost level sends everything pending
    /// as one job and returns how many messages it held. Flushing a scope that
    /// was never opened is a no-op.
    ///
    /// # Errors
    /// Returns the dispatcher's error; the pending messages are dropped.
    pub fn flush<N: NotificationDispatcher + ?Sized>(
        &mut self,
        dispatcher: &mut N,
    ) -> Result<usize, NotificationError> {
        if self.depth == 0 {
            return Ok(0);
        }
        self.depth -= 1;
        if self.depth > 0 || self.pending.is_empty() {
            return Ok(0);
        }
        let job = std::mem::take(&mut self.pending);
        let count = job.len();
        debug!(count, "flushing notification batch");
        dispatcher.send_deferred(job)?;
        Ok(count)
    }
}
