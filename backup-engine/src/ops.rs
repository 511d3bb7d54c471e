//! Pending asynchronous operations keyed by correlation token.
//!
//! A step that dispatches work registers a token and suspends on the receiver; whoever
//! finishes the work completes the token. Late completions for cancelled tokens are dropped.

use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationToken(u64);

impl fmt::Display for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

pub struct PendingOperationTable<T> {
    next_token: Arc<AtomicU64>,
    pending: Arc<DashMap<OperationToken, oneshot::Sender<T>>>,
}

impl<T> Clone for PendingOperationTable<T> {
    fn clone(&self) -> Self {
        Self {
            next_token: Arc::clone(&self.next_token),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<T> Default for PendingOperationTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingOperationTable<T> {
    pub fn new() -> Self {
        Self {
            next_token: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self) -> (OperationToken, oneshot::Receiver<T>) {
        let token = OperationToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending.insert(token, tx);
        (token, rx)
    }

    /// Deliver a result. Returns false if the token is unknown (already completed or cancelled).
    pub fn complete(&self, token: OperationToken, value: T) -> bool {
        match self.pending.remove(&token) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => {
                tracing::debug!(%token, "Dropping completion for unknown operation");
                false
            }
        }
    }

    pub fn cancel(&self, token: OperationToken) -> bool {
        self.pending.remove(&token).is_some()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
