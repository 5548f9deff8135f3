//! Process-wide lock table for `synchronized` blocks
//!
//! Entries are created lazily per lock id and live as long as the engine.
//! Each entry has its own mutex, so contention on one id never blocks
//! sessions working with another. A lock carries no owner identity, only
//! held/free state plus a FIFO queue of waiters.
//!
//! Release hands the lock directly to the oldest waiter: the entry stays
//! held and the waiter is marked as granted, so a newcomer can never slip in
//! between a release and the wake-up of the next waiter.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// Something that can wait for a lock.
pub(crate) trait LockWaiter: Send + Sync {
    /// Stable identity of the waiter.
    fn waiter_id(&self) -> u64;
    /// Make the waiter runnable again.
    fn wake(&self);
}

/// Result of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// The caller now holds the lock
    Acquired,
    /// The caller was appended to the wait queue
    Queued,
}

#[derive(Default)]
struct LockState {
    held: bool,
    waiters: VecDeque<Arc<dyn LockWaiter>>,
    granted: HashSet<u64>,
}

#[derive(Default)]
struct LockEntry {
    state: Mutex<LockState>,
}

/// Lazily populated table of named locks.
#[derive(Default)]
pub(crate) struct LockTable {
    entries: RwLock<HashMap<String, Arc<LockEntry>>>,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Arc<LockEntry> {
        if let Some(entry) = self.entries.read().get(id) {
            return Arc::clone(entry);
        }
        Arc::clone(self.entries.write().entry(id.to_string()).or_default())
    }

    /// Take the lock if free, otherwise join the wait queue.
    pub(crate) fn acquire(&self, id: &str, waiter: Arc<dyn LockWaiter>) -> Acquire {
        let entry = self.entry(id);
        let mut state = entry.state.lock();
        if !state.held {
            state.held = true;
            tracing::debug!("lock '{}' acquired by {}", id, waiter.waiter_id());
            Acquire::Acquired
        } else {
            tracing::debug!("lock '{}' busy, {} queued", id, waiter.waiter_id());
            state.waiters.push_back(waiter);
            Acquire::Queued
        }
    }

    /// True once a queued waiter has been handed the lock.
    pub(crate) fn take_grant(&self, id: &str, waiter_id: u64) -> bool {
        self.entry(id).state.lock().granted.remove(&waiter_id)
    }

    /// Release the lock, handing it to the oldest waiter if there is one.
    pub(crate) fn release(&self, id: &str) {
        let entry = self.entry(id);
        let next = {
            let mut state = entry.state.lock();
            Self::hand_off(&mut state)
        };
        match next {
            Some(waiter) => {
                tracing::debug!("lock '{}' handed to {}", id, waiter.waiter_id());
                waiter.wake();
            }
            None => tracing::debug!("lock '{}' released", id),
        }
    }

    fn hand_off(state: &mut LockState) -> Option<Arc<dyn LockWaiter>> {
        match state.waiters.pop_front() {
            Some(waiter) => {
                state.granted.insert(waiter.waiter_id());
                Some(waiter)
            }
            None => {
                state.held = false;
                None
            }
        }
    }

    /// Withdraw a killed waiter; a grant it never used is passed on.
    pub(crate) fn abandon(&self, id: &str, waiter_id: u64) {
        let entry = self.entry(id);
        let next = {
            let mut state = entry.state.lock();
            if state.granted.remove(&waiter_id) {
                Self::hand_off(&mut state)
            } else {
                state.waiters.retain(|waiter| waiter.waiter_id() != waiter_id);
                None
            }
        };
        if let Some(waiter) = next {
            waiter.wake();
        }
    }

    pub(crate) fn is_held(&self, id: &str) -> bool {
        self.entries
            .read()
            .get(id)
            .is_some_and(|entry| entry.state.lock().held)
    }

    pub(crate) fn waiting(&self, id: &str) -> usize {
        self.entries
            .read()
            .get(id)
            .map_or(0, |entry| entry.state.lock().waiters.len())
    }

    /// Drop every entry. Called once the worker pool has stopped.
    pub(crate) fn clear(&self) {
        self.entries.write().clear();
    }
}
