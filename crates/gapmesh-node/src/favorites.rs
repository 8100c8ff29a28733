//! Favorites — the local book of peers that matter.
//!
//! A favorite is a unilateral local assertion keyed by the peer's
//! fingerprint. Mutual favorites (both sides asserted) are what unlocks
//! the internet transport between two peers. The whole book persists as
//! one JSON blob in the keychain and is rewritten on every mutation, so
//! runtime changes survive restarts.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use gapmesh_core::identity::Fingerprint;
use gapmesh_core::platform::Keychain;

/// Keychain slot for the serialized book.
pub const KEYCHAIN_FAVORITES: &str = "favorites/v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FavoriteRecord {
    /// The peer's static public key.
    pub peer_public_key: [u8; 32],
    pub nickname: Option<String>,
    /// We favorited them.
    pub we_favorited: bool,
    /// They told us they favorited us.
    pub they_favorited: bool,
    /// Their relay-network identity, if shared.
    pub nostr_pubkey: Option<String>,
    /// Wall-clock ms of the last contact.
    pub last_seen_millis: u64,
}

impl FavoriteRecord {
    pub fn is_mutual(&self) -> bool {
        self.we_favorited && self.they_favorited
    }
}

pub struct FavoritesBook {
    keychain: Arc<dyn Keychain>,
    records: DashMap<String, FavoriteRecord>,
}

impl FavoritesBook {
    /// Load the book from the keychain (empty when absent or corrupt).
    pub fn open(keychain: Arc<dyn Keychain>) -> Self {
        let records = DashMap::new();
        if let Some(blob) = keychain.get(KEYCHAIN_FAVORITES) {
            match serde_json::from_slice::<HashMap<String, FavoriteRecord>>(&blob) {
                Ok(loaded) => {
                    for (fingerprint, record) in loaded {
                        records.insert(fingerprint, record);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "favorites blob corrupt, starting empty");
                }
            }
        }
        Self { keychain, records }
    }

    fn persist(&self) {
        let snapshot: HashMap<String, FavoriteRecord> = self
            .records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        match serde_json::to_vec(&snapshot) {
            Ok(blob) => self.keychain.set(KEYCHAIN_FAVORITES, &blob),
            Err(e) => tracing::warn!(error = %e, "favorites serialization failed"),
        }
    }

    /// Set or clear our side of the favorite link.
    pub fn set_favorite(
        &self,
        fingerprint: &Fingerprint,
        peer_public_key: [u8; 32],
        nickname: Option<String>,
        is_favorite: bool,
        now_millis: u64,
    ) {
        self.records
            .entry(fingerprint.as_str().to_string())
            .and_modify(|record| {
                record.we_favorited = is_favorite;
                if nickname.is_some() {
                    record.nickname = nickname.clone();
                }
                record.last_seen_millis = now_millis;
            })
            .or_insert_with(|| FavoriteRecord {
                peer_public_key,
                nickname,
                we_favorited: is_favorite,
                they_favorited: false,
                nostr_pubkey: None,
                last_seen_millis: now_millis,
            });
        self.persist();
        tracing::info!(peer = fingerprint.short(), is_favorite, "favorite updated");
    }

    /// Record the peer's side of the link, from a favorite-notification.
    /// Returns the updated record.
    pub fn peer_asserted(
        &self,
        fingerprint: &Fingerprint,
        peer_public_key: [u8; 32],
        is_favorite: bool,
        nostr_pubkey: Option<String>,
        now_millis: u64,
    ) -> FavoriteRecord {
        let record = self
            .records
            .entry(fingerprint.as_str().to_string())
            .and_modify(|record| {
                record.they_favorited = is_favorite;
                if nostr_pubkey.is_some() {
                    record.nostr_pubkey = nostr_pubkey.clone();
                }
                record.last_seen_millis = now_millis;
            })
            .or_insert_with(|| FavoriteRecord {
                peer_public_key,
                nickname: None,
                we_favorited: false,
                they_favorited: is_favorite,
                nostr_pubkey,
                last_seen_millis: now_millis,
            })
            .clone();
        self.persist();
        record
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<FavoriteRecord> {
        self.records.get(fingerprint.as_str()).map(|r| r.clone())
    }

    pub fn is_mutual(&self, fingerprint: &Fingerprint) -> bool {
        self.get(fingerprint).map(|r| r.is_mutual()).unwrap_or(false)
    }

    pub fn list(&self) -> Vec<(String, FavoriteRecord)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn remove(&self, fingerprint: &Fingerprint) {
        self.records.remove(fingerprint.as_str());
        self.persist();
    }

    /// Destroy the book, in memory and in the keychain.
    pub fn wipe(&self) {
        self.records.clear();
        self.keychain.delete(KEYCHAIN_FAVORITES);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gapmesh_core::platform::MemoryKeychain;

    fn fp(n: u8) -> Fingerprint {
        Fingerprint::of_public_key(&[n; 32])
    }

    #[test]
    fn favorite_persists_across_reload() {
        let keychain = Arc::new(MemoryKeychain::new());
        let book = FavoritesBook::open(keychain.clone());
        book.set_favorite(&fp(1), [1; 32], Some("alice".into()), true, 1000);

        let reloaded = FavoritesBook::open(keychain);
        let record = reloaded.get(&fp(1)).unwrap();
        assert!(record.we_favorited);
        assert!(!record.is_mutual());
        assert_eq!(record.nickname.as_deref(), Some("alice"));
    }

    #[test]
    fn mutual_requires_both_sides() {
        let book = FavoritesBook::open(Arc::new(MemoryKeychain::new()));
        book.set_favorite(&fp(1), [1; 32], None, true, 1000);
        assert!(!book.is_mutual(&fp(1)));

        let record = book.peer_asserted(&fp(1), [1; 32], true, Some("npub".into()), 2000);
        assert!(record.is_mutual());
        assert_eq!(record.nostr_pubkey.as_deref(), Some("npub"));
        assert!(book.is_mutual(&fp(1)));
    }

    #[test]
    fn unfavorite_breaks_mutuality() {
        let book = FavoritesBook::open(Arc::new(MemoryKeychain::new()));
        book.set_favorite(&fp(1), [1; 32], None, true, 1000);
        book.peer_asserted(&fp(1), [1; 32], true, None, 1000);
        assert!(book.is_mutual(&fp(1)));

        book.set_favorite(&fp(1), [1; 32], None, false, 2000);
        assert!(!book.is_mutual(&fp(1)));
    }

    #[test]
    fn wipe_clears_memory_and_keychain() {
        let keychain = Arc::new(MemoryKeychain::new());
        let book = FavoritesBook::open(keychain.clone());
        book.set_favorite(&fp(1), [1; 32], None, true, 1000);
        book.wipe();
        assert!(book.is_empty());
        assert!(keychain.get(KEYCHAIN_FAVORITES).is_none());
        assert!(FavoritesBook::open(keychain).is_empty());
    }

    #[test]
    fn corrupt_blob_starts_empty() {
        let keychain = Arc::new(MemoryKeychain::new());
        keychain.set(KEYCHAIN_FAVORITES, b"not json");
        let book = FavoritesBook::open(keychain);
        assert!(book.is_empty());
    }
}
