//! Persistent Tier - Durable Key-Value Store
//!
//! Globally shared tier holding cache entries with quality-adjusted TTLs.
//! The same store also carries the cold index, warmed markers and alert
//! records under distinct namespaces.
//!
//! # Design
//!
//! - Pluggable [`KvStore`] backend (Workers KV, Redis, ...) behind a trait
//! - Records are JSON encoded; TTL is delegated to the backend and re-checked
//!   on read so a lax backend cannot serve expired entries

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::entry::CacheEntry;
use super::policy::TtlPolicy;
use crate::clock::SharedClock;
use crate::error::Result;

/// Key-value backend trait
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value; expired values read as `None`
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a value with a TTL (last write wins)
    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Delete a value, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Backend statistics
    fn stats(&self) -> KvStoreStats {
        KvStoreStats::default()
    }
}

/// Backend statistics
#[derive(Debug, Clone, Default)]
pub struct KvStoreStats {
    pub object_count: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
}

/// In-memory backend with clock-driven expiry
pub struct InMemoryKvStore {
    storage: DashMap<String, (Bytes, DateTime<Utc>)>,
    clock: SharedClock,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryKvStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            storage: DashMap::new(),
            clock,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Raw keys currently stored (expired included)
    pub fn keys(&self) -> Vec<String> {
        self.storage.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();

        let found = self
            .storage
            .get(key)
            .map(|e| (e.value().0.clone(), e.value().1));

        match found {
            Some((_, expires_at)) if now >= expires_at => {
                self.storage.remove_if(key, |_, (_, exp)| now >= *exp);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.storage.insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.storage.remove(key).is_some())
    }

    fn stats(&self) -> KvStoreStats {
        KvStoreStats {
            object_count: self.storage.len() as u64,
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Record namespaces sharing the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// Hot cache entries
    Entry,
    /// Pointers into cold object storage
    ColdIndex,
    /// Warming dedupe markers
    Warmed,
    /// Alert dedupe records
    Alert,
}

impl Namespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            Namespace::Entry => "cache:",
            Namespace::ColdIndex => "cold-index:",
            Namespace::Warmed => "warmed:",
            Namespace::Alert => "alert:",
        }
    }

    pub fn scoped(&self, key: &str) -> String {
        format!("{}{}", self.prefix(), key)
    }
}

/// Persistent tier
pub struct PersistentTier {
    store: Arc<dyn KvStore>,
    policy: TtlPolicy,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PersistentTier {
    pub fn new(store: Arc<dyn KvStore>, policy: TtlPolicy, clock: SharedClock) -> Self {
        Self {
            store,
            policy,
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Read a cache entry
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entry: Option<CacheEntry> = self.get_record(Namespace::Entry, key).await?;
        let now = self.clock.now();

        match entry {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Write a cache entry for its remaining TTL
    pub async fn put(&self, entry: &CacheEntry) -> Result<()> {
        let ttl = entry.remaining_ttl(self.clock.now());
        if ttl.is_zero() {
            return Ok(());
        }
        self.put_record(Namespace::Entry, &entry.key, entry, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.delete_record(Namespace::Entry, key).await
    }

    /// Read a JSON record from a namespace
    pub async fn get_record<T: DeserializeOwned>(
        &self,
        namespace: Namespace,
        key: &str,
    ) -> Result<Option<T>> {
        match self.store.get(&namespace.scoped(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write a JSON record into a namespace
    pub async fn put_record<T: Serialize + ?Sized>(
        &self,
        namespace: Namespace,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let raw = serde_json::to_vec(value)?;
        self.store
            .put(&namespace.scoped(key), Bytes::from(raw), ttl)
            .await
    }

    pub async fn delete_record(&self, namespace: Namespace, key: &str) -> Result<bool> {
        self.store.delete(&namespace.scoped(key)).await
    }

    pub fn policy(&self) -> &TtlPolicy {
        &self.policy
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn backend_stats(&self) -> KvStoreStats {
        self.store.stats()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::CacheKey;
    use crate::clock::{Clock, ManualClock};
    use serde_json::json;

    fn make_tier(clock: Arc<ManualClock>) -> (PersistentTier, Arc<InMemoryKvStore>) {
        let store = Arc::new(InMemoryKvStore::new(clock.clone()));
        let tier = PersistentTier::new(store.clone(), TtlPolicy::default(), clock);
        (tier, store)
    }

    #[tokio::test]
    async fn test_in_memory_store_put_get_delete() {
        let clock = ManualClock::starting_now();
        let store = InMemoryKvStore::new(clock.clone());

        store
            .put("k", Bytes::from_static(b"v"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);

        let stats = store.stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.deletes, 2);
    }

    #[tokio::test]
    async fn test_in_memory_store_expiry() {
        let clock = ManualClock::starting_now();
        let store = InMemoryKvStore::new(clock.clone());

        store
            .put("k", Bytes::from_static(b"v"), Duration::from_secs(10))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(9));
        assert!(store.get("k").await.unwrap().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(store.get("k").await.unwrap().is_none());
        assert_eq!(store.stats().object_count, 0);
    }

    #[tokio::test]
    async fn test_entry_roundtrip_under_namespace() {
        let clock = ManualClock::starting_now();
        let (tier, store) = make_tier(clock.clone());

        let key = CacheKey::isbn("9780451524935");
        let entry = CacheEntry::positive(
            &key,
            json!({"title": "1984"}),
            0.95,
            Duration::from_secs(3600),
            clock.now(),
        );
        tier.put(&entry).await.unwrap();

        assert_eq!(store.keys(), vec!["cache:isbn:9780451524935".to_string()]);
        assert_eq!(tier.get("isbn:9780451524935").await.unwrap(), Some(entry));
        assert_eq!(tier.hits(), 1);
    }

    #[tokio::test]
    async fn test_entry_expires() {
        let clock = ManualClock::starting_now();
        let (tier, _) = make_tier(clock.clone());

        let entry = CacheEntry::positive(
            &CacheKey::title("dune"),
            json!({}),
            0.5,
            Duration::from_secs(60),
            clock.now(),
        );
        tier.put(&entry).await.unwrap();

        clock.advance(Duration::from_secs(61));
        assert!(tier.get("title:dune").await.unwrap().is_none());
        assert_eq!(tier.misses(), 1);
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let clock = ManualClock::starting_now();
        let (tier, _) = make_tier(clock);

        tier.put_record(Namespace::Warmed, "title:dune", &json!({"x": 1}), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(tier.get("title:dune").await.unwrap().is_none());
        let marker: Option<serde_json::Value> = tier
            .get_record(Namespace::Warmed, "title:dune")
            .await
            .unwrap();
        assert_eq!(marker, Some(json!({"x": 1})));
    }

    #[test]
    fn test_namespace_prefixes_distinct() {
        let prefixes = [
            Namespace::Entry.prefix(),
            Namespace::ColdIndex.prefix(),
            Namespace::Warmed.prefix(),
            Namespace::Alert.prefix(),
        ];
        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(unique.len(), prefixes.len());
    }
}
