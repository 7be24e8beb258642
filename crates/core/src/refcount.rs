// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Count of clients depending on the supervisor staying up.

use std::sync::Arc;

use tokio::sync::watch;

/// Result of a decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decref {
    /// Clients remain; carries the new count.
    Remaining(usize),
    /// This decrement took the count to zero.
    ReachedZero,
    /// The count was already zero; nothing changed.
    AlreadyZero,
}

/// Shared reference count. Clones observe and mutate the same counter.
#[derive(Debug, Clone)]
pub struct RefCount {
    tx: Arc<watch::Sender<usize>>,
}

impl RefCount {
    pub fn new(initial: usize) -> Self {
        let (tx, _) = watch::channel(initial);
        RefCount { tx: Arc::new(tx) }
    }

    pub fn get(&self) -> usize {
        *self.tx.borrow()
    }

    /// True while at least one client depends on the supervisor.
    pub fn is_alive(&self) -> bool {
        self.get() > 0
    }

    pub fn incref(&self) -> usize {
        let mut count = 0;
        self.tx.send_modify(|n| {
            *n += 1;
            count = *n;
        });
        count
    }

    pub fn decref(&self) -> Decref {
        let mut outcome = Decref::AlreadyZero;
        self.tx.send_if_modified(|n| match *n {
            0 => false,
            1 => {
                *n = 0;
                outcome = Decref::ReachedZero;
                true
            }
            _ => {
                *n -= 1;
                outcome = Decref::Remaining(*n);
                true
            }
        });
        outcome
    }

    /// Drop every reference at once (signals, fatal engine exit).
    /// Returns true if this call took the count to zero.
    pub fn clear(&self) -> bool {
        self.tx.send_if_modified(|n| {
            let changed = *n != 0;
            *n = 0;
            changed
        })
    }

    /// Resolve once the count is zero.
    pub async fn wait_zero(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

#[cfg(test)]
#[path = "refcount_tests.rs"]
mod tests;
