//! Retransmit timeout management and cancellation.
//!
//! Reliable delivery requires that unacknowledged packets are re-sent if no
//! reply arrives within a bounded time.  This module provides:
//! - [`Backoff`]: the per-attempt receive timeout.  It starts at the base
//!   timeout, doubles on each consecutive timeout (exponential back-off) up
//!   to a ceiling.  Every operation starts a fresh one, so a success
//!   means the next operation waits the base timeout again.
//! - [`CancelToken`]: a cloneable handle used to abort the
//!   unbounded loops (`accept`, `disconnect`) without changing what they do
//!   on the wire.
//!
//! The timeout is threaded explicitly into each bounded wait; nothing here
//! mutates socket state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::TransportConfig;

/// Doubling timeout with a ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            max,
            current: base,
        }
    }

    /// Base and ceiling taken from `config`.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.base_timeout, config.max_timeout())
    }

    /// Timeout to use for the next attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Double the timeout after a failed attempt, capped at the ceiling.
    pub fn back_off(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

/// Cooperative cancellation for long-running waits.
///
/// Cloning yields a handle to the same token; cancelling any clone wakes
/// every waiter.  A token nobody cancels simply never fires.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the token.  Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the only way out is a `true`.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
