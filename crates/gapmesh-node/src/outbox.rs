//! Per-peer outbox — messages waiting for a route.
//!
//! A private send that finds no reachable transport lands here. Queues
//! are bounded (oldest evicted, surfaced as a system message) and entries
//! age out after the configured maximum. Flushing drains a peer's queue
//! in order; the controller re-drives each entry through the normal send
//! path.

use std::collections::VecDeque;
use std::sync::Mutex;

use std::collections::HashMap;

use gapmesh_core::wire::PeerId;

#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub message_id: String,
    pub text: String,
    pub recipient_nickname: Option<String>,
    /// Wall-clock ms at enqueue time.
    pub enqueued_at: u64,
}

pub struct Outbox {
    queues: Mutex<HashMap<PeerId, VecDeque<OutboxEntry>>>,
    depth: usize,
    max_age_millis: u64,
}

/// What an enqueue did.
pub struct Enqueued {
    /// An older entry was evicted to make room.
    pub evicted: Option<OutboxEntry>,
}

impl Outbox {
    pub fn new(depth: usize, max_age_millis: u64) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            depth: depth.max(1),
            max_age_millis,
        }
    }

    pub fn enqueue(&self, peer: PeerId, entry: OutboxEntry) -> Enqueued {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        let queue = queues.entry(peer).or_default();
        let evicted = if queue.len() >= self.depth {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(entry);
        Enqueued { evicted }
    }

    /// Drain everything queued for `peer`, oldest first.
    pub fn drain(&self, peer: PeerId) -> Vec<OutboxEntry> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .remove(&peer)
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    /// Discard entries older than the maximum age. Returns what was
    /// dropped, for system messaging.
    pub fn sweep(&self, now_millis: u64) -> Vec<(PeerId, OutboxEntry)> {
        let cutoff = now_millis.saturating_sub(self.max_age_millis);
        let mut dropped = Vec::new();
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        for (peer, queue) in queues.iter_mut() {
            while queue
                .front()
                .map(|entry| entry.enqueued_at < cutoff)
                .unwrap_or(false)
            {
                if let Some(entry) = queue.pop_front() {
                    dropped.push((*peer, entry));
                }
            }
        }
        queues.retain(|_, queue| !queue.is_empty());
        dropped
    }

    pub fn pending_for(&self, peer: PeerId) -> usize {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&peer)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }
}
