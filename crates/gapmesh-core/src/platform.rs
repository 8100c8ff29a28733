//! Host-provided services the core consumes but never implements.
//!
//! The surrounding application owns secure storage, clocks, randomness,
//! and notification presentation. The core sees them only through these
//! object-safe traits so that tests (and other hosts) can substitute
//! their own.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Secure key-value storage for identity keys and the favorites blob.
/// Implementations are expected to encrypt at rest.
pub trait Keychain: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn set(&self, key: &str, value: &[u8]);
    fn delete(&self, key: &str);
    /// Destroy every stored value. Backs panic wipe.
    fn wipe_all(&self);
}

/// Wall-clock and monotonic time.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
    /// Monotonic milliseconds from an arbitrary origin. Never goes
    /// backwards; used for stall and staleness decisions.
    fn monotonic_millis(&self) -> u64;
}

/// Cryptographically strong randomness.
pub trait SecureRandom: Send + Sync {
    fn fill(&self, dest: &mut [u8]);
}

/// User-facing notification sink.
pub trait Notifier: Send + Sync {
    fn present(&self, title: &str, body: &str, payload: &[u8]);
}

// ── Provided implementations ──────────────────────────────────────────────────

/// Real time from the OS.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn monotonic_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// OS randomness via the thread-local CSPRNG.
pub struct OsRandom;

impl SecureRandom for OsRandom {
    fn fill(&self, dest: &mut [u8]) {
        rand::thread_rng().fill_bytes(dest);
    }
}

/// In-memory keychain. The default seam for tests and the reference for
/// what a platform keychain must do; production hosts supply their own.
#[derive(Default)]
pub struct MemoryKeychain {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Keychain for MemoryKeychain {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &[u8]) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_owned(), value.to_vec());
    }

    fn delete(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn wipe_all(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
