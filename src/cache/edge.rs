//! Edge Tier - Process-Local Stale-While-Revalidate Cache
//!
//! Lowest-latency tier. Every entry carries a fresh window and a stale window;
//! reads classify the entry by age and never block on revalidation.
//!
//! # Design
//!
//! - `DashMap` for concurrent access from request handlers
//! - Windows are capped so the edge TTL never exceeds the persistent TTL
//! - Entry-count bound with oldest-first eviction (expired entries go first)

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::entry::CacheEntry;
use super::policy::{EdgeWindows, Freshness};
use crate::clock::SharedClock;

/// Edge tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    /// Default fresh/stale windows for writes
    pub windows: EdgeWindows,
    /// Maximum number of entries held
    pub max_entries: usize,
    /// Entries evicted per eviction pass
    pub eviction_batch_size: usize,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            windows: EdgeWindows::default(),
            max_entries: 100_000,
            eviction_batch_size: 1000,
        }
    }
}

#[derive(Debug, Clone)]
struct EdgeSlot {
    entry: CacheEntry,
    windows: EdgeWindows,
    inserted_at: DateTime<Utc>,
}

/// Edge read result
#[derive(Debug, Clone)]
pub struct EdgeHit {
    pub entry: CacheEntry,
    /// `Fresh` or `Stale`; expired entries are never returned
    pub freshness: Freshness,
    /// Age since the edge write
    pub age: Duration,
    pub windows: EdgeWindows,
}

impl EdgeHit {
    pub fn is_stale(&self) -> bool {
        self.freshness == Freshness::Stale
    }
}

/// Edge tier
pub struct EdgeTier {
    storage: DashMap<String, EdgeSlot>,
    config: EdgeConfig,
    clock: SharedClock,
    fresh_hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl EdgeTier {
    pub fn new(config: EdgeConfig, clock: SharedClock) -> Self {
        Self {
            storage: DashMap::new(),
            config,
            clock,
            fresh_hits: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Look up a key, classifying it as fresh or stale
    pub fn get(&self, key: &str) -> Option<EdgeHit> {
        let now = self.clock.now();

        let hit = self.storage.get(key).map(|slot| {
            let age = (now - slot.inserted_at).to_std().unwrap_or(Duration::ZERO);
            (slot.entry.clone(), slot.windows, age)
        });

        let Some((entry, windows, age)) = hit else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        match windows.classify(age) {
            Freshness::Expired => {
                self.storage.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            freshness => {
                match freshness {
                    Freshness::Fresh => self.fresh_hits.fetch_add(1, Ordering::Relaxed),
                    _ => self.stale_hits.fetch_add(1, Ordering::Relaxed),
                };
                Some(EdgeHit {
                    entry,
                    freshness,
                    age,
                    windows,
                })
            }
        }
    }

    /// Insert with the default windows, capped by the entry's remaining TTL
    pub fn put(&self, entry: CacheEntry) {
        let windows = self.config.windows;
        self.put_with_windows(entry, windows);
    }

    /// Insert with explicit windows, capped by the entry's remaining TTL
    pub fn put_with_windows(&self, entry: CacheEntry, windows: EdgeWindows) {
        let now = self.clock.now();
        let windows = windows.capped(entry.remaining_ttl(now));
        if windows.total().is_zero() {
            return;
        }

        if self.storage.len() >= self.config.max_entries && !self.storage.contains_key(&entry.key)
        {
            self.evict(now);
        }

        self.storage.insert(
            entry.key.clone(),
            EdgeSlot {
                entry,
                windows,
                inserted_at: now,
            },
        );
    }

    /// Remove a key, returning whether it was present
    pub fn remove(&self, key: &str) -> bool {
        self.storage.remove(key).is_some()
    }

    /// Presence check that ignores expiry
    pub fn contains(&self, key: &str) -> bool {
        self.storage.contains_key(key)
    }

    /// Evict expired entries first, then the oldest writes
    fn evict(&self, now: DateTime<Utc>) {
        let mut candidates: Vec<(String, bool, DateTime<Utc>)> = self
            .storage
            .iter()
            .map(|slot| {
                let age = (now - slot.inserted_at).to_std().unwrap_or(Duration::ZERO);
                let expired = slot.windows.classify(age) == Freshness::Expired;
                (slot.key().clone(), expired, slot.inserted_at)
            })
            .collect();

        // Expired first, then oldest
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        for (key, _, _) in candidates.into_iter().take(self.config.eviction_batch_size.max(1)) {
            if self.storage.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn clear(&self) {
        self.storage.clear();
    }

    pub fn windows(&self) -> EdgeWindows {
        self.config.windows
    }

    pub fn stats(&self) -> EdgeStats {
        let fresh_hits = self.fresh_hits.load(Ordering::Relaxed);
        let stale_hits = self.stale_hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = fresh_hits + stale_hits + misses;
        EdgeStats {
            entries: self.len(),
            fresh_hits,
            stale_hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_ratio: if total == 0 {
                0.0
            } else {
                (fresh_hits + stale_hits) as f64 / total as f64
            },
        }
    }
}

/// Edge tier statistics
#[derive(Debug, Clone)]
pub struct EdgeStats {
    pub entries: usize,
    pub fresh_hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Hit ratio (0.0 - 1.0)
    pub hit_ratio: f64,
}

// =============================================================================
// Tests
// =============================================================================
