//! The cache of validated implementations.
//!
//! Entries are keyed by signature and replaced whole, never merged. Trusted entries
//! are visible process-wide; untrusted entries created inside a session stay private
//! to that session until it closes and discards them. Synthesis for a key is guarded
//! by an expiring single-flight claim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::core::storage::ArtifactStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trust {
    /// Not validated yet, or demoted after a runtime failure.
    Untrusted,
    /// Passed validation at least once.
    Trusted,
}

/// A cached implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    /// Normalized task prompt, kept for listing and inspection.
    pub prompt: String,
    pub source: String,
    pub trust: Trust,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: Option<DateTime<Utc>>,
    /// Session that created this entry; `None` once process-wide.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub complexity: String,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        prompt: impl Into<String>,
        source: impl Into<String>,
        trust: Trust,
    ) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            prompt: prompt.into(),
            source: source.into(),
            trust,
            created_at: now,
            last_validated_at: (trust == Trust::Trusted).then_some(now),
            origin: None,
            explanation: String::new(),
            complexity: String::new(),
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trust == Trust::Trusted
    }

    /// Whether a session with the given lineage (itself first, then its ancestors)
    /// may see this entry.
    pub fn visible_to(&self, lineage: &[Uuid]) -> bool {
        match (self.trust, self.origin) {
            (Trust::Trusted, _) | (_, None) => true,
            (Trust::Untrusted, Some(origin)) => lineage.contains(&origin),
        }
    }
}

struct ClaimRecord {
    token: Uuid,
    expires_at: Instant,
    released: Arc<Notify>,
}

/// Result of trying to claim a key for synthesis.
pub enum ClaimAttempt {
    Acquired(ClaimGuard),
    Busy(Busy),
}

/// Exclusive right to synthesize one key. Released on drop.
pub struct ClaimGuard {
    store: Arc<CacheStore>,
    key: String,
    token: Uuid,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.store.release(&self.key, self.token);
    }
}

/// Another caller holds the claim for a key.
pub struct Busy {
    store: Arc<CacheStore>,
    key: String,
    token: Uuid,
    expires_at: Instant,
    released: Arc<Notify>,
}

impl Busy {
    /// Waits until the holder releases the claim or the claim expires.
    pub async fn wait(self) {
        let notified = self.released.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.store.is_claimed(&self.key, self.token) {
            return;
        }
        let deadline = tokio::time::Instant::from_std(self.expires_at);
        let _ = tokio::time::timeout_at(deadline, notified).await;
    }
}

/// Process-wide cache of implementations, optionally backed by durable storage.
pub struct CacheStore {
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    claims: Mutex<HashMap<String, ClaimRecord>>,
    storage: Option<Arc<dyn ArtifactStorage>>,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    /// Memory-only cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            claims: Mutex::new(HashMap::new()),
            storage: None,
        }
    }

    pub fn with_storage(storage: Arc<dyn ArtifactStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::new()
        }
    }

    /// Loads every stored entry into memory. Returns how many were loaded.
    pub fn warm(&self) -> usize {
        let Some(storage) = &self.storage else {
            return 0;
        };
        let keys = match storage.keys() {
            Ok(keys) => keys,
            Err(e) => {
                log::warn!("Could not list cached artifacts: {}", e);
                return 0;
            }
        };
        let mut loaded = 0;
        for key in keys {
            match storage.get(&key) {
                Ok(Some(entry)) => {
                    self.write_entries().insert(key, Arc::new(entry));
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => log::warn!("Skipping unreadable cached artifact {}: {}", key, e),
            }
        }
        log::debug!("Loaded {} cached artifact(s)", loaded);
        loaded
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<CacheEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry for `key` if the session lineage may see it.
    ///
    /// Storage read failures are logged and treated as a miss.
    pub fn lookup(&self, key: &str, lineage: &[Uuid]) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.read_entries().get(key) {
            return entry.visible_to(lineage).then(|| Arc::clone(entry));
        }

        let storage = self.storage.as_ref()?;
        match storage.get(key) {
            Ok(Some(entry)) => {
                let entry = Arc::new(entry);
                let entry = Arc::clone(
                    self.write_entries()
                        .entry(key.to_string())
                        .or_insert(entry),
                );
                entry.visible_to(lineage).then_some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("Cache read failed for {}, treating as miss: {}", key, e);
                None
            }
        }
    }

    /// Atomically replaces the entry for its key. Process-wide entries are also
    /// written to durable storage; a write failure only loses durability.
    pub fn put(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        self.write_entries()
            .insert(entry.key.clone(), Arc::clone(&entry));
        if entry.origin.is_none() {
            self.persist(&entry);
        }
        entry
    }

    /// Stores an untrusted entry private to `session`, unless another entry already
    /// holds the key. Never persisted. Returns whether it was stored.
    pub fn put_provisional(&self, mut entry: CacheEntry, session: Uuid) -> bool {
        entry.trust = Trust::Untrusted;
        entry.origin = Some(session);
        let mut entries = self.write_entries();
        let vacant = entries
            .get(&entry.key)
            .is_none_or(|existing| existing.origin == Some(session) && !existing.is_trusted());
        if vacant {
            entries.insert(entry.key.clone(), Arc::new(entry));
        }
        vacant
    }

    fn persist(&self, entry: &CacheEntry) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.put(entry) {
                log::warn!("Cache write failed for {}, keeping it in memory only: {}", entry.key, e);
            }
        }
    }

    /// Removes an entry from memory and storage. Returns whether it was cached.
    pub fn invalidate(&self, key: &str) -> bool {
        let existed = self.write_entries().remove(key).is_some();
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.delete(key) {
                log::warn!("Cache delete failed for {}: {}", key, e);
            }
        }
        existed
    }

    /// Marks a trusted entry untrusted so the next call re-validates it.
    pub fn demote(&self, key: &str) -> bool {
        let demoted = {
            let mut entries = self.write_entries();
            match entries.get(key) {
                Some(entry) if entry.is_trusted() => {
                    let mut updated = CacheEntry::clone(entry);
                    updated.trust = Trust::Untrusted;
                    updated.origin = None;
                    let updated = Arc::new(updated);
                    entries.insert(key.to_string(), Arc::clone(&updated));
                    Some(updated)
                }
                _ => None,
            }
        };
        match demoted {
            Some(entry) => {
                self.persist(&entry);
                true
            }
            None => false,
        }
    }

    /// Drops the untrusted entries a session created. Returns how many were dropped.
    pub fn discard_provisional(&self, session: Uuid) -> usize {
        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|_, e| !(e.trust == Trust::Untrusted && e.origin == Some(session)));
        before - entries.len()
    }

    /// Snapshot of all in-memory entries, ordered by key.
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        let mut all: Vec<Arc<CacheEntry>> = self.read_entries().values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    fn lock_claims(&self) -> std::sync::MutexGuard<'_, HashMap<String, ClaimRecord>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tries to become the single synthesizer of `key` for at most `ttl`.
    /// An expired claim is taken over.
    pub fn claim(self: &Arc<Self>, key: &str, ttl: Duration) -> ClaimAttempt {
        let now = Instant::now();
        let mut claims = self.lock_claims();
        if let Some(record) = claims.get(key) {
            if record.expires_at > now {
                return ClaimAttempt::Busy(Busy {
                    store: Arc::clone(self),
                    key: key.to_string(),
                    token: record.token,
                    expires_at: record.expires_at,
                    released: Arc::clone(&record.released),
                });
            }
            log::warn!("Claim on {} expired, taking it over", key);
            record.released.notify_waiters();
        }
        let token = Uuid::new_v4();
        claims.insert(
            key.to_string(),
            ClaimRecord {
                token,
                expires_at: now + ttl,
                released: Arc::new(Notify::new()),
            },
        );
        ClaimAttempt::Acquired(ClaimGuard {
            store: Arc::clone(self),
            key: key.to_string(),
            token,
        })
    }

    fn is_claimed(&self, key: &str, token: Uuid) -> bool {
        self.lock_claims()
            .get(key)
            .is_some_and(|r| r.token == token && r.expires_at > Instant::now())
    }

    fn release(&self, key: &str, token: Uuid) {
        let mut claims = self.lock_claims();
        if claims.get(key).is_some_and(|r| r.token == token) {
            if let Some(record) = claims.remove(key) {
                record.released.notify_waiters();
            }
        }
    }

    /// Whether a live claim exists for `key`.
    pub fn in_flight(&self, key: &str) -> bool {
        self.lock_claims()
            .get(key)
            .is_some_and(|r| r.expires_at > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::StorageError;
    use crate::core::storage::MemoryStorage;

    struct FailingStorage;

    impl ArtifactStorage for FailingStorage {
        fn get(&self, _key: &str) -> Result<Option<CacheEntry>, StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        fn put(&self, _entry: &CacheEntry) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        fn delete(&self, _key: &str) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
        fn keys(&self) -> Result<Vec<String>, StorageError> {
            Err(StorageError::Unavailable("disk on fire".into()))
        }
    }

    fn trusted(key: &str, source: &str) -> CacheEntry {
        CacheEntry::new(key, "prompt", source, Trust::Trusted)
    }

    #[test]
    fn test_put_replaces_whole_entry() {
        let store = CacheStore::new();
        store.put(trusted("k", "v1"));
        let mut second = CacheEntry::new("k", "other prompt", "v2", Trust::Untrusted);
        second.complexity = "O(n)".into();
        store.put(second);

        let entry = store.lookup("k", &[]).unwrap();
        assert_eq!(entry.source, "v2");
        assert_eq!(entry.prompt, "other prompt");
        assert_eq!(entry.trust, Trust::Untrusted);
        assert_eq!(store.entries().len(), 1);
    }

    #[test]
    fn test_provisional_visibility() {
        let store = CacheStore::new();
        let owner = Uuid::new_v4();
        let child = Uuid::new_v4();
        let sibling = Uuid::new_v4();

        let mut provisional = CacheEntry::new("k", "p", "src", Trust::Untrusted);
        provisional.origin = Some(owner);
        store.put(provisional);

        assert!(store.lookup("k", &[owner]).is_some());
        assert!(store.lookup("k", &[child, owner]).is_some());
        assert!(store.lookup("k", &[sibling]).is_none());
        assert!(store.lookup("k", &[]).is_none());

        assert_eq!(store.discard_provisional(sibling), 0);
        assert_eq!(store.discard_provisional(owner), 1);
        assert!(store.lookup("k", &[owner]).is_none());
    }

    #[test]
    fn test_provisional_never_displaces_other_entries() {
        let store = CacheStore::new();
        let owner = Uuid::new_v4();
        let other = Uuid::new_v4();

        assert!(store.put_provisional(CacheEntry::new("k", "p", "v1", Trust::Untrusted), owner));
        assert!(store.put_provisional(CacheEntry::new("k", "p", "v2", Trust::Untrusted), owner));
        assert!(!store.put_provisional(CacheEntry::new("k", "p", "v3", Trust::Untrusted), other));
        assert_eq!(store.lookup("k", &[owner]).unwrap().source, "v2");

        store.put(trusted("t", "src"));
        assert!(!store.put_provisional(CacheEntry::new("t", "p", "bad", Trust::Untrusted), owner));
        assert!(store.lookup("t", &[]).unwrap().is_trusted());
    }

    #[test]
    fn test_provisional_entries_are_not_persisted() {
        let storage = Arc::new(MemoryStorage::new());
        let store = CacheStore::with_storage(storage.clone());
        let mut provisional = CacheEntry::new("k", "p", "src", Trust::Untrusted);
        provisional.origin = Some(Uuid::new_v4());
        store.put(provisional);
        assert!(storage.get("k").unwrap().is_none());

        store.put(trusted("k", "src"));
        assert!(storage.get("k").unwrap().unwrap().is_trusted());
    }

    #[test]
    fn test_demote_keeps_entry_visible_everywhere() {
        let storage = Arc::new(MemoryStorage::new());
        let store = CacheStore::with_storage(storage.clone());
        store.put(trusted("k", "src"));

        assert!(store.demote("k"));
        assert!(!store.demote("k"));
        let entry = store.lookup("k", &[Uuid::new_v4()]).unwrap();
        assert_eq!(entry.trust, Trust::Untrusted);
        assert_eq!(storage.get("k").unwrap().unwrap().trust, Trust::Untrusted);
    }

    #[test]
    fn test_invalidate() {
        let storage = Arc::new(MemoryStorage::new());
        let store = CacheStore::with_storage(storage.clone());
        store.put(trusted("k", "src"));
        assert!(store.invalidate("k"));
        assert!(!store.invalidate("k"));
        assert!(store.lookup("k", &[]).is_none());
        assert!(storage.get("k").unwrap().is_none());
    }

    #[test]
    fn test_lookup_falls_back_to_storage_and_warm() {
        let storage = Arc::new(MemoryStorage::new());
        storage.put(&trusted("a", "src-a")).unwrap();
        storage.put(&trusted("b", "src-b")).unwrap();

        let store = CacheStore::with_storage(storage.clone());
        assert_eq!(store.lookup("a", &[]).unwrap().source, "src-a");

        let fresh = CacheStore::with_storage(storage);
        assert_eq!(fresh.warm(), 2);
        assert_eq!(fresh.entries().len(), 2);
    }

    #[test]
    fn test_storage_failures_degrade_to_miss() {
        let store = CacheStore::with_storage(Arc::new(FailingStorage));
        assert!(store.lookup("k", &[]).is_none());
        assert_eq!(store.warm(), 0);

        // Write failure keeps the entry in memory
        store.put(trusted("k", "src"));
        assert_eq!(store.lookup("k", &[]).unwrap().source, "src");
        assert!(store.invalidate("k"));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let store = Arc::new(CacheStore::new());
        let guard = match store.claim("k", Duration::from_secs(30)) {
            ClaimAttempt::Acquired(guard) => guard,
            ClaimAttempt::Busy(_) => panic!("first claim must succeed"),
        };
        assert!(store.in_flight("k"));
        assert!(matches!(store.claim("k", Duration::from_secs(30)), ClaimAttempt::Busy(_)));
        // Other keys are unaffected
        assert!(matches!(store.claim("other", Duration::from_secs(30)), ClaimAttempt::Acquired(_)));

        let busy = match store.claim("k", Duration::from_secs(30)) {
            ClaimAttempt::Busy(busy) => busy,
            ClaimAttempt::Acquired(_) => panic!("claim must be busy"),
        };
        let waiter = tokio::spawn(busy.wait());
        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter must wake on release")
            .unwrap();

        assert!(!store.in_flight("k"));
        assert!(matches!(store.claim("k", Duration::from_secs(30)), ClaimAttempt::Acquired(_)));
    }

    #[tokio::test]
    async fn test_abandoned_claim_expires() {
        let store = Arc::new(CacheStore::new());
        let guard = match store.claim("k", Duration::from_millis(20)) {
            ClaimAttempt::Acquired(guard) => guard,
            ClaimAttempt::Busy(_) => panic!("first claim must succeed"),
        };
        // Simulate a holder that never releases
        std::mem::forget(guard);

        if let ClaimAttempt::Busy(busy) = store.claim("k", Duration::from_secs(30)) {
            tokio::time::timeout(Duration::from_secs(5), busy.wait())
                .await
                .expect("wait must end at expiry");
        }
        assert!(matches!(store.claim("k", Duration::from_secs(30)), ClaimAttempt::Acquired(_)));
    }

    #[test]
    fn test_stale_guard_does_not_release_new_claim() {
        let store = Arc::new(CacheStore::new());
        let stale = match store.claim("k", Duration::from_millis(0)) {
            ClaimAttempt::Acquired(guard) => guard,
            ClaimAttempt::Busy(_) => panic!("first claim must succeed"),
        };
        // Zero TTL: the claim is immediately expired and can be taken over
        let fresh = match store.claim("k", Duration::from_secs(30)) {
            ClaimAttempt::Acquired(guard) => guard,
            ClaimAttempt::Busy(_) => panic!("expired claim must be taken over"),
        };
        drop(stale);
        assert!(store.in_flight("k"));
        drop(fresh);
        assert!(!store.in_flight("k"));
    }
}
