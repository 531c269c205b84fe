//! Cold Tier - Archived Entries in Object Storage
//!
//! Long-tail entries live as compressed objects in bulk storage. A small
//! index record in the persistent store points each key at its object; a
//! cold index hit schedules rehydration, which promotes the entry back into
//! the persistent and edge tiers and then drops the index record.
//!
//! # Archive Format
//!
//! One object per key: the JSON `CacheEntry`, LZ4 block-compressed with the
//! uncompressed size prepended.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::edge::EdgeTier;
use super::entry::CacheEntry;
use super::persistent::{Namespace, PersistentTier};
use crate::error::{Error, Result};

// =============================================================================
// Object Store
// =============================================================================

/// Bulk object storage backend (R2, S3, ...)
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, location: &str) -> Result<Option<Bytes>>;

    async fn put(&self, location: &str, data: Bytes) -> Result<()>;
}

/// In-memory object store
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, Bytes>,
    reads: AtomicU64,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Number of object reads served
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn get(&self, location: &str) -> Result<Option<Bytes>> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.objects.get(location).map(|o| o.value().clone()))
    }

    async fn put(&self, location: &str, data: Bytes) -> Result<()> {
        self.objects.insert(location.to_string(), data);
        Ok(())
    }
}

// =============================================================================
// Archive Codec
// =============================================================================

/// Encode an entry as an archive object
pub fn encode_archive(entry: &CacheEntry) -> Result<Bytes> {
    let json = serde_json::to_vec(entry)?;
    let compressed =
        lz4::block::compress(&json, None, true).map_err(|e| Error::CompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })?;
    Ok(Bytes::from(compressed))
}

/// Decode an archive object
pub fn decode_archive(data: &[u8]) -> Result<CacheEntry> {
    let json = lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
        algorithm: "LZ4".into(),
        reason: e.to_string(),
    })?;
    Ok(serde_json::from_slice(&json)?)
}

// =============================================================================
// Cold Index
// =============================================================================

/// Pointer from a cache key to its archived object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColdIndexEntry {
    pub key: String,
    pub cold_location: String,
    pub archived_at: DateTime<Utc>,
}

/// Index records stored beside hot entries under their own namespace
pub struct ColdIndex {
    store: Arc<PersistentTier>,
    ttl: Duration,
}

impl ColdIndex {
    pub fn new(store: Arc<PersistentTier>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<ColdIndexEntry>> {
        self.store.get_record(Namespace::ColdIndex, key).await
    }

    pub async fn insert(&self, entry: &ColdIndexEntry) -> Result<()> {
        self.store
            .put_record(Namespace::ColdIndex, &entry.key, entry, self.ttl)
            .await
    }

    /// Remove a record, returning whether it existed
    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.store.delete_record(Namespace::ColdIndex, key).await
    }
}

// =============================================================================
// Cold Tier
// =============================================================================

/// Cold tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColdConfig {
    /// Object key prefix for archives
    pub location_prefix: String,
    /// Lifetime of index records
    pub index_ttl_secs: u64,
}

impl Default for ColdConfig {
    fn default() -> Self {
        Self {
            location_prefix: "archive".into(),
            index_ttl_secs: 365 * 24 * 60 * 60,
        }
    }
}

/// Outcome of a rehydration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rehydration {
    /// Entry promoted into the persistent and edge tiers
    Promoted,
    /// No index record; already promoted or never archived
    NotArchived,
}

/// Cold tier
pub struct ColdTier {
    index: ColdIndex,
    objects: Arc<dyn ObjectStore>,
    persistent: Arc<PersistentTier>,
    edge: Arc<EdgeTier>,
    config: ColdConfig,
    promotions: AtomicU64,
    failures: AtomicU64,
}

impl ColdTier {
    pub fn new(
        config: ColdConfig,
        objects: Arc<dyn ObjectStore>,
        persistent: Arc<PersistentTier>,
        edge: Arc<EdgeTier>,
    ) -> Self {
        let index = ColdIndex::new(
            persistent.clone(),
            Duration::from_secs(config.index_ttl_secs),
        );
        Self {
            index,
            objects,
            persistent,
            edge,
            config,
            promotions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn index(&self) -> &ColdIndex {
        &self.index
    }

    /// Cold index lookup
    pub async fn lookup(&self, key: &str) -> Result<Option<ColdIndexEntry>> {
        self.index.lookup(key).await
    }

    /// Object location for a key
    pub fn location_for(&self, entry: &CacheEntry) -> String {
        format!(
            "{}/{}/{}.json.lz4",
            self.config.location_prefix,
            entry.category,
            urlencoding::encode(&entry.key)
        )
    }

    /// Write an entry to object storage and index it
    pub async fn archive(&self, entry: &CacheEntry) -> Result<ColdIndexEntry> {
        let location = self.location_for(entry);
        self.objects.put(&location, encode_archive(entry)?).await?;

        let record = ColdIndexEntry {
            key: entry.key.clone(),
            cold_location: location,
            archived_at: self.persistent.clock().now(),
        };
        self.index.insert(&record).await?;

        debug!(key = %entry.key, location = %record.cold_location, "Archived entry");
        Ok(record)
    }

    /// Promote an archived entry back into the hot tiers
    ///
    /// Safe to run concurrently for the same key: writes are last-write-wins
    /// and a missing index record is not an error. On failure the index
    /// record is left in place for the next miss to retry.
    #[instrument(skip(self), fields(key = %key))]
    pub async fn rehydrate(&self, key: &str) -> Result<Rehydration> {
        let result = self.try_rehydrate(key).await;
        match &result {
            Ok(Rehydration::Promoted) => {
                self.promotions.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Rehydration::NotArchived) => {}
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Rehydration failed; index entry kept");
            }
        }
        result
    }

    async fn try_rehydrate(&self, key: &str) -> Result<Rehydration> {
        let failure = |reason: String| Error::RehydrationFailure {
            key: key.to_string(),
            reason,
        };

        let Some(record) = self.index.lookup(key).await.map_err(|e| failure(e.to_string()))?
        else {
            return Ok(Rehydration::NotArchived);
        };

        let data = self
            .objects
            .get(&record.cold_location)
            .await
            .map_err(|e| failure(e.to_string()))?
            .ok_or_else(|| failure(format!("object {} missing", record.cold_location)))?;

        let archived = decode_archive(&data).map_err(|e| failure(e.to_string()))?;
        let now = self.persistent.clock().now();
        let promoted = archived.restamped(self.persistent.policy().rehydrated_ttl(), now);

        self.persistent
            .put(&promoted)
            .await
            .map_err(|e| failure(e.to_string()))?;
        self.edge.put(promoted);

        let deleted = self
            .index
            .remove(key)
            .await
            .map_err(|e| failure(e.to_string()))?;

        info!(location = %record.cold_location, deleted, "Rehydrated entry from cold storage");
        Ok(Rehydration::Promoted)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
