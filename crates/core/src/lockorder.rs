//! Declared lock order and a debug-mode checker.
//!
//! A thread holding a lock of rank `r` may only acquire locks of strictly
//! greater rank. Producers therefore rank before the receivers they call
//! while locked. Debug builds (tests included) assert this on every
//! acquisition; release builds compile the bookkeeping away.

use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// `SetBinder`; calls into the provider and the projector while locked.
    Binder,
    /// Receiver registry of an API-map provider.
    ApiMapProvider,
    /// A `RelayMap`; calls its receivers while locked.
    RelayMap,
    /// `WorkloadProjector`; enqueues work while locked.
    WorkloadProjector,
    /// Work queue internals; calls nothing.
    WorkQueue,
}

/// The whole order, outermost first.
pub const LOCK_ORDER: &[LockRank] = &[
    LockRank::Binder,
    LockRank::ApiMapProvider,
    LockRank::RelayMap,
    LockRank::WorkloadProjector,
    LockRank::WorkQueue,
];

/// A mutex tagged with its place in [`LOCK_ORDER`].
pub struct OrderedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> OrderedMutex<T> {
    pub fn new(rank: LockRank, value: T) -> Self {
        Self { rank, inner: Mutex::new(value) }
    }

    pub fn rank(&self) -> LockRank { self.rank }

    pub fn lock(&self) -> OrderedGuard<'_, T> {
        held::acquire(self.rank);
        OrderedGuard { guard: self.inner.lock(), rank: self.rank }
    }
}

impl<T: Default> OrderedMutex<T> {
    pub fn with_default(rank: LockRank) -> Self { Self::new(rank, T::default()) }
}

pub struct OrderedGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for OrderedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T { &self.guard }
}

impl<T> DerefMut for OrderedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T { &mut self.guard }
}

impl<T> Drop for OrderedGuard<'_, T> {
    fn drop(&mut self) { held::release(self.rank) }
}

/// Ranks currently held by this thread, in acquisition order.
pub fn held_locks() -> Vec<LockRank> { held::snapshot() }

#[cfg(debug_assertions)]
mod held {
    use super::LockRank;
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
    }

    pub(super) fn acquire(rank: LockRank) {
        HELD.with(|h| {
            let mut h = h.borrow_mut();
            if let Some(top) = h.iter().max() {
                assert!(rank > *top, "lock order violation: acquiring {rank:?} while holding {top:?} (held: {h:?})");
            }
            h.push(rank);
        })
    }

    pub(super) fn release(rank: LockRank) {
        let _ = HELD.try_with(|h| {
            let mut h = h.borrow_mut();
            if let Some(pos) = h.iter().rposition(|r| *r == rank) {
                h.remove(pos);
            }
        });
    }

    pub(super) fn snapshot() -> Vec<LockRank> { HELD.with(|h| h.borrow().clone()) }
}

#[cfg(not(debug_assertions))]
mod held {
    use super::LockRank;

    pub(super) fn acquire(_rank: LockRank) {}
    pub(super) fn release(_rank: LockRank) {}
    pub(super) fn snapshot() -> Vec<LockRank> { Vec::new() }
}
