//! Negative Cache
//!
//! "No results" outcomes are cached like positive results, tagged
//! `negative: true` and given a short TTL, so repeated lookups for missing
//! entities do not re-run the provider chain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::edge::EdgeTier;
use super::entry::{CacheEntry, CacheKey};
use super::persistent::PersistentTier;
use crate::error::Result;

/// Whether a provider payload means "no results"
///
/// Null, empty arrays, empty objects and list envelopes whose
/// `items`/`works`/`results` array is empty all count as empty.
pub fn is_empty_result(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) if map.is_empty() => true,
        Value::Object(map) => ["items", "works", "results"].iter().any(|field| {
            matches!(map.get(*field), Some(Value::Array(items)) if items.is_empty())
        }),
        _ => false,
    }
}

/// Writes negative entries to the persistent and edge tiers
pub struct NegativeCache {
    persistent: Arc<PersistentTier>,
    edge: Arc<EdgeTier>,
    stored: AtomicU64,
    served: AtomicU64,
}

impl NegativeCache {
    pub fn new(persistent: Arc<PersistentTier>, edge: Arc<EdgeTier>) -> Self {
        Self {
            persistent,
            edge,
            stored: AtomicU64::new(0),
            served: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.persistent.policy().negative_ttl()
    }

    /// Record a confirmed-empty result for `key`
    ///
    /// The persistent write replaces any positive entry for the key.
    pub async fn record(&self, key: &CacheKey) -> Result<CacheEntry> {
        let entry = CacheEntry::negative(key, self.ttl(), self.persistent.clock().now());
        self.persistent.put(&entry).await?;
        self.edge.put(entry.clone());
        self.stored.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    /// Count a negative entry served to a caller
    pub fn record_served(&self) {
        self.served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stored(&self) -> u64 {
        self.stored.load(Ordering::Relaxed)
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }
}
