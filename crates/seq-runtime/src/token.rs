//! Counting release tokens between the sequencer and one service.
//!
//! The post side is lock-free (atomic counters plus an unpark) so it is safe
//! to call from the dispatch step. The wait side parks the owning service
//! thread until a token is available. Every post is eventually observable by
//! exactly one successful wait or drain; counts never go negative.
//!
//! The poster closes the channel after its last post (or when dropped).
//! [`ReleaseWaiter::drain_closed`] waits for that, so a waiter leaving its
//! loop cannot miss a post still in flight.

use crossbeam_utils::sync::{Parker, Unparker};
use serde::Serialize;
use static_assertions::{assert_impl_all, assert_not_impl_any};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct TokenState {
    pending: AtomicU64,
    posted: AtomicU64,
    consumed: AtomicU64,
    closed: AtomicBool,
}

/// Posting half, owned by the sequencer.
#[derive(Debug)]
pub struct ReleasePoster {
    state: Arc<TokenState>,
    unparker: Unparker,
}

/// Waiting half, owned by the service thread.
#[derive(Debug)]
pub struct ReleaseWaiter {
    state: Arc<TokenState>,
    parker: Parker,
}

assert_impl_all!(ReleasePoster: Send, Sync);
assert_impl_all!(ReleaseWaiter: Send);
assert_not_impl_any!(ReleaseWaiter: Sync, Clone);
assert_not_impl_any!(ReleasePoster: Clone);

/// Token totals at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCounts {
    /// Tokens ever posted.
    pub posted: u64,
    /// Tokens ever consumed (waits plus drains).
    pub consumed: u64,
    /// Tokens currently available.
    pub pending: u64,
}

/// Create a connected poster/waiter pair with zero pending tokens.
#[must_use]
pub fn release_channel() -> (ReleasePoster, ReleaseWaiter) {
    let state = Arc::new(TokenState::default());
    let parker = Parker::new();
    let unparker = parker.unparker().clone();
    (
        ReleasePoster {
            state: Arc::clone(&state),
            unparker,
        },
        ReleaseWaiter { state, parker },
    )
}

fn counts(state: &TokenState) -> TokenCounts {
    // consumed is read first so a concurrent wait cannot make it exceed posted.
    let consumed = state.consumed.load(Ordering::SeqCst);
    let pending = state.pending.load(Ordering::SeqCst);
    let posted = state.posted.load(Ordering::SeqCst);
    TokenCounts {
        posted,
        consumed,
        pending,
    }
}

impl ReleasePoster {
    /// Make one token available and wake the waiter. Never blocks.
    #[inline]
    pub fn post(&self) {
        self.state.posted.fetch_add(1, Ordering::SeqCst);
        self.state.pending.fetch_add(1, Ordering::SeqCst);
        self.unparker.unpark();
    }

    /// Mark that no further token will be posted and wake the waiter.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.unparker.unpark();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Current totals.
    #[must_use]
    pub fn counts(&self) -> TokenCounts {
        counts(&self.state)
    }
}

impl Drop for ReleasePoster {
    fn drop(&mut self) {
        self.close();
    }
}

impl ReleaseWaiter {
    /// Take one token if available.
    pub fn try_wait(&self) -> bool {
        let taken = self
            .state
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if taken {
            self.state.consumed.fetch_add(1, Ordering::SeqCst);
        }
        taken
    }

    /// Block until a token is available and take it.
    ///
    /// Spurious wake-ups are absorbed by re-checking the count.
    pub fn wait(&self) {
        while !self.try_wait() {
            self.parker.park();
        }
    }

    /// Take every pending token without blocking. Returns how many.
    pub fn drain(&self) -> u64 {
        let mut drained = 0;
        while self.try_wait() {
            drained += 1;
        }
        drained
    }

    /// Block until the poster has closed, then take every remaining token.
    /// Returns how many were taken.
    pub fn drain_closed(&self) -> u64 {
        while !self.state.closed.load(Ordering::Acquire) {
            self.parker.park();
        }
        self.drain()
    }

    /// Current totals.
    #[must_use]
    pub fn counts(&self) -> TokenCounts {
        counts(&self.state)
    }
}
