//! Session admission control.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounded counting semaphore limiting concurrent sessions.
///
/// One token is held for the lifetime of one in-flight session: from the
/// moment the main loop admits it until the session's last exit path runs.
pub(crate) struct TokenPool {
    capacity: usize,
    free: Semaphore,
    in_use: AtomicUsize,
}

impl TokenPool {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Semaphore::new(capacity),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Blocks until a session slot is free.
    pub(crate) async fn acquire(&self) {
        let permit = self.free.acquire().await.expect("token semaphore closed");
        permit.forget();
        self.in_use.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns a slot to the pool.
    ///
    /// Releasing a token that was never acquired is a programming error
    /// and panics.
    pub(crate) fn release(&self) {
        let prev = self.in_use.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "token released with none in use");
        self.free.add_permits(1);
    }

    /// Number of sessions currently admitted.
    ///
    /// The value may be stale by the time the caller reads it.
    pub(crate) fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

/// One-shot handle returning a single acquired token.
///
/// The supervisor's timeout path and the relay splice can both end a
/// session; whichever runs first returns the token and later calls are
/// no-ops, so every acquisition is balanced by exactly one release.
pub(crate) struct SessionToken {
    pool: Arc<TokenPool>,
    released: AtomicBool,
}

impl SessionToken {
    pub(crate) fn new(pool: Arc<TokenPool>) -> Self {
        Self {
            pool,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.pool.release();
        }
    }
}
