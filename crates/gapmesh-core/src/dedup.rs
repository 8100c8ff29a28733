//! Seen-packet cache — the flood-relay deduplicator.
//!
//! A bounded LRU set of packet fingerprints shared by every transport.
//! `insert` answers the only question relay cares about: "is this the
//! first time we have seen this packet?"

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Default fingerprint capacity.
pub const DEFAULT_DEDUP_CAPACITY: usize = 4096;

/// Thread-safe bounded LRU set of fingerprints.
pub struct SeenCache {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    /// fingerprint -> recency sequence number
    entries: HashMap<String, u64>,
    /// recency sequence number -> fingerprint, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Record a fingerprint. Returns true iff it was not already present.
    /// Re-inserting an existing fingerprint refreshes its recency.
    pub fn insert(&self, fingerprint: &str) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let seq = inner.next_seq;
        inner.next_seq += 1;

        if let Some(old_seq) = inner.entries.insert(fingerprint.to_owned(), seq) {
            inner.order.remove(&old_seq);
            inner.order.insert(seq, fingerprint.to_owned());
            return false;
        }
        inner.order.insert(seq, fingerprint.to_owned());

        if inner.entries.len() > self.capacity {
            if let Some((&oldest_seq, _)) = inner.order.iter().next() {
                if let Some(evicted) = inner.order.remove(&oldest_seq) {
                    inner.entries.remove(&evicted);
                }
            }
        }
        true
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything. Used by panic wipe.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.clear();
        inner.order.clear();
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
