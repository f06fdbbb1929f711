//! Replay guard: a bounded FIFO set of recently seen admission tokens.
//!
//! Every connection attempt presents a freshly salted hash of the shared
//! secret, so a legitimate dial is never a repeat.  Remembering the last N
//! tokens therefore blocks replay of a copied connection URL for as long
//! as it stays within the window.

use std::collections::HashMap;
use std::sync::Mutex;

/// Default number of admission tokens remembered.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1000;

/// Outcome of presenting a key to the guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Fresh,
    Duplicate,
}

/// Bounded set with FIFO eviction.  Thread-safe under a single mutex;
/// admission rates make contention irrelevant.
pub struct ReplayGuard {
    inner: Mutex<Ring>,
}

struct Ring {
    index: HashMap<String, usize>,
    slots: Vec<Option<String>>,
    cursor: usize,
}

impl ReplayGuard {
    /// `capacity` is the number of keys retained: inserting key N+1 into a
    /// full guard evicts the oldest key, which becomes admissible again.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ReplayGuard {
            inner: Mutex::new(Ring {
                index: HashMap::with_capacity(capacity),
                slots: vec![None; capacity],
                cursor: 0,
            }),
        }
    }

    /// Record `key` if unseen.  A key already present returns
    /// [`Admission::Duplicate`] without any state change.
    pub fn admit(&self, key: &str) -> Admission {
        let mut ring = self.inner.lock().unwrap();
        if ring.index.contains_key(key) {
            return Admission::Duplicate;
        }
        let cursor = ring.cursor;
        if let Some(evicted) = ring.slots[cursor].take() {
            ring.index.remove(&evicted);
        }
        ring.index.insert(key.to_owned(), cursor);
        ring.slots[cursor] = Some(key.to_owned());
        ring.cursor = (cursor + 1) % ring.slots.len();
        Admission::Fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeat_within_window_is_duplicate() {
        let guard = ReplayGuard::new(3);
        assert_eq!(guard.admit("a"), Admission::Fresh);
        assert_eq!(guard.admit("b"), Admission::Fresh);
        assert_eq!(guard.admit("a"), Admission::Duplicate);
        assert_eq!(guard.admit("b"), Admission::Duplicate);
    }

    #[test]
    fn full_ring_evicts_exactly_the_oldest() {
        let guard = ReplayGuard::new(3);
        for key in ["a", "b", "c"] {
            assert_eq!(guard.admit(key), Admission::Fresh);
        }
        for key in ["a", "b", "c"] {
            assert_eq!(guard.admit(key), Admission::Duplicate);
        }
        // "d" evicts "a" and only "a".
        assert_eq!(guard.admit("d"), Admission::Fresh);
        assert_eq!(guard.admit("a"), Admission::Fresh);
        assert_eq!(guard.admit("c"), Admission::Duplicate);
        assert_eq!(guard.admit("d"), Admission::Duplicate);
    }

    #[test]
    fn never_retains_more_than_capacity() {
        let guard = ReplayGuard::new(2);
        for i in 0..10 {
            assert_eq!(guard.admit(&format!("k{i}")), Admission::Fresh);
        }
        // Only the two most recent keys are still remembered.
        assert_eq!(guard.admit("k8"), Admission::Duplicate);
        assert_eq!(guard.admit("k9"), Admission::Duplicate);
        assert_eq!(guard.admit("k7"), Admission::Fresh);
    }

    #[test]
    fn capacity_is_clamped_to_at_least_one() {
        let guard = ReplayGuard::new(0);
        assert_eq!(guard.admit("a"), Admission::Fresh);
        assert_eq!(guard.admit("a"), Admission::Duplicate);
        assert_eq!(guard.admit("b"), Admission::Fresh);
        assert_eq!(guard.admit("a"), Admission::Fresh);
    }
}
