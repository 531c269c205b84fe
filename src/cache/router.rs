//! Cache Router - Unified Tiered Lookup
//!
//! Threads a lookup through the edge, persistent and cold tiers and owns the
//! write path. This is the component request handlers and the warming
//! consumer depend on.
//!
//! # Lookup Order
//!
//! 1. Edge, fresh: return
//! 2. Edge, stale: return immediately, refresh in the background
//! 3. Persistent: promote to edge, return
//! 4. Cold index: return a miss, rehydrate in the background
//! 5. Miss
//!
//! Tier errors are logged and treated as misses. Writes never fail the
//! caller; persistence failures go to the metrics sink. Background refresh
//! and rehydration are spawned onto a task tracker and never awaited by the
//! request that triggered them.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::coalescer::Coalescer;
use super::cold::{ColdConfig, ColdTier, InMemoryObjectStore, ObjectStore, Rehydration};
use super::edge::{EdgeConfig, EdgeTier};
use super::entry::{CacheEntry, CacheKey};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::negative::{is_empty_result, NegativeCache};
use super::persistent::{InMemoryKvStore, KvStore, PersistentTier};
use super::policy::TtlPolicy;
use crate::analytics::{events, sources, AnalyticsEvent, SharedSink};
use crate::clock::SharedClock;
use crate::error::{Error, Result};
use crate::provider::{FetchParams, Provider};

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Refresh stale edge hits in the background
    pub refresh_on_stale: bool,
    /// Rehydrate cold index hits in the background
    pub rehydrate_on_cold: bool,
    /// Copy persistent hits into the edge tier
    pub promote_to_edge: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            refresh_on_stale: true,
            rehydrate_on_cold: true,
            promote_to_edge: true,
        }
    }
}

/// Where a hit was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
    EdgeFresh,
    EdgeStale,
    Persistent,
}

impl CacheSource {
    /// Analytics source label
    pub fn label(&self) -> &'static str {
        match self {
            CacheSource::EdgeFresh => sources::EDGE_FRESH,
            CacheSource::EdgeStale => sources::EDGE_STALE,
            CacheSource::Persistent => sources::PERSISTENT,
        }
    }
}

/// Cache hit
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub payload: Value,
    pub source: CacheSource,
    pub is_stale: bool,
    pub quality_score: f64,
    pub latency: Duration,
}

/// Lookup result
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheHit),
    /// A negative entry: the query is known to have no results
    Empty { source: CacheSource },
    /// Nothing usable. `cold` is set when a cold index hit scheduled rehydration.
    Miss { cold: bool },
}

impl CacheLookup {
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheLookup::Miss { .. })
    }

    pub fn hit(&self) -> Option<&CacheHit> {
        match self {
            CacheLookup::Hit(hit) => Some(hit),
            _ => None,
        }
    }
}

/// Read-through result
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved {
    Cached(CacheHit),
    ConfirmedEmpty { source: CacheSource },
    /// Fetched from the provider and stored
    Fetched(Value),
    /// Provider found nothing; a negative entry was stored
    FetchedEmpty,
}

impl Resolved {
    /// Payload, if any
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Resolved::Cached(hit) => Some(&hit.payload),
            Resolved::Fetched(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Tier set used to build a router
#[derive(Clone)]
pub struct CacheTiers {
    pub edge: Arc<EdgeTier>,
    pub persistent: Arc<PersistentTier>,
    pub cold: Arc<ColdTier>,
}

impl CacheTiers {
    /// Build the tiers over the given stores
    pub fn new(
        policy: TtlPolicy,
        edge: EdgeConfig,
        cold: ColdConfig,
        kv: Arc<dyn KvStore>,
        objects: Arc<dyn ObjectStore>,
        clock: SharedClock,
    ) -> Self {
        let edge = Arc::new(EdgeTier::new(edge, clock.clone()));
        let persistent = Arc::new(PersistentTier::new(kv, policy, clock));
        let cold = Arc::new(ColdTier::new(cold, objects, persistent.clone(), edge.clone()));
        Self {
            edge,
            persistent,
            cold,
        }
    }

    /// Tiers over in-memory stores
    pub fn in_memory(policy: TtlPolicy, edge: EdgeConfig, clock: SharedClock) -> Self {
        Self::new(
            policy,
            edge,
            ColdConfig::default(),
            Arc::new(InMemoryKvStore::new(clock.clone())),
            Arc::new(InMemoryObjectStore::new()),
            clock,
        )
    }
}

struct RouterInner {
    config: RouterConfig,
    edge: Arc<EdgeTier>,
    persistent: Arc<PersistentTier>,
    cold: Arc<ColdTier>,
    negative: NegativeCache,
    coalescer: Coalescer<Option<Value>>,
    provider: Option<Arc<dyn Provider>>,
    sink: SharedSink,
    metrics: CacheMetrics,
    rehydrating: DashSet<String>,
    tasks: TaskTracker,
}

/// Unified cache router. Cheap to clone.
#[derive(Clone)]
pub struct CacheRouter {
    inner: Arc<RouterInner>,
}

impl CacheRouter {
    pub fn new(
        config: RouterConfig,
        tiers: CacheTiers,
        sink: SharedSink,
        provider: Option<Arc<dyn Provider>>,
    ) -> Self {
        let negative = NegativeCache::new(tiers.persistent.clone(), tiers.edge.clone());
        Self {
            inner: Arc::new(RouterInner {
                config,
                edge: tiers.edge,
                persistent: tiers.persistent,
                cold: tiers.cold,
                negative,
                coalescer: Coalescer::new(),
                provider,
                sink,
                metrics: CacheMetrics::new(),
                rehydrating: DashSet::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Look a key up across the tiers
    pub async fn get(&self, key: &CacheKey) -> CacheLookup {
        let tracker = LatencyTracker::start();
        let lookup = self.lookup(key, &tracker).await;
        if let CacheLookup::Miss { cold } = lookup {
            self.emit_lookup(key, miss_source(cold), &tracker);
        }
        lookup
    }

    /// Tier walk shared by `get` and `get_or_fetch`
    ///
    /// Hits are reported to the sink here. Misses are left to the caller so a
    /// read-through can report the latency of the whole request.
    async fn lookup(&self, key: &CacheKey, tracker: &LatencyTracker) -> CacheLookup {
        let inner = &self.inner;
        let rendered = key.render();

        if let Some(hit) = inner.edge.get(&rendered) {
            inner.metrics.record_edge_latency(tracker.elapsed());
            let stale = hit.is_stale();
            inner.metrics.record_edge_hit(stale);

            let source = if stale {
                CacheSource::EdgeStale
            } else {
                CacheSource::EdgeFresh
            };
            if stale && inner.config.refresh_on_stale {
                self.spawn_refresh(key);
            }
            return self.found(key, hit.entry, source, tracker);
        }

        let persistent_tracker = LatencyTracker::start();
        match inner.persistent.get(&rendered).await {
            Ok(Some(entry)) => {
                inner
                    .metrics
                    .record_persistent_latency(persistent_tracker.elapsed());
                inner.metrics.record_persistent_hit();
                if inner.config.promote_to_edge {
                    inner.edge.put(entry.clone());
                }
                return self.found(key, entry, CacheSource::Persistent, tracker);
            }
            Ok(None) => {}
            Err(e) => self.tier_error("persistent", key, &e),
        }

        let cold = match inner.cold.lookup(&rendered).await {
            Ok(Some(_)) => {
                if inner.config.rehydrate_on_cold {
                    self.spawn_rehydration(key);
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                self.tier_error("cold", key, &e);
                false
            }
        };

        inner.metrics.record_miss(cold);
        CacheLookup::Miss { cold }
    }

    fn found(
        &self,
        key: &CacheKey,
        entry: CacheEntry,
        source: CacheSource,
        tracker: &LatencyTracker,
    ) -> CacheLookup {
        self.emit_lookup(key, source.label(), tracker);

        if entry.negative {
            self.inner.metrics.record_negative_hit();
            self.inner.negative.record_served();
            return CacheLookup::Empty { source };
        }

        CacheLookup::Hit(CacheHit {
            payload: entry.payload,
            source,
            is_stale: source == CacheSource::EdgeStale,
            quality_score: entry.quality_score,
            latency: tracker.elapsed(),
        })
    }

    // =========================================================================
    // Write path
    // =========================================================================

    /// Store a payload in the persistent tier with a quality-adjusted TTL
    ///
    /// Any edge copy of the key (including a negative entry) is dropped so
    /// the next read sees this payload. Never fails; persistence errors are
    /// logged and reported to the metrics sink.
    pub async fn set(&self, key: &CacheKey, payload: Value, quality: Option<f64>) {
        self.store(key, payload, quality).await;
    }

    /// Store a "no results" entry with the negative TTL
    pub async fn set_negative(&self, key: &CacheKey) {
        match self.inner.negative.record(key).await {
            Ok(_) => self.inner.metrics.record_write(),
            Err(e) => self.write_failed(key, &e),
        }
    }

    /// Write a positive entry to the edge tier
    pub fn populate_edge(&self, entry: CacheEntry) {
        self.inner.edge.put(entry);
    }

    async fn store(&self, key: &CacheKey, payload: Value, quality: Option<f64>) -> CacheEntry {
        let inner = &self.inner;
        let policy = inner.persistent.policy();
        let quality = quality.unwrap_or_else(|| policy.quality_of(&payload));
        let ttl = policy.adjusted_ttl(key.category(), quality);
        let entry = CacheEntry::positive(key, payload, quality, ttl, inner.persistent.clock().now());

        inner.edge.remove(&entry.key);
        match inner.persistent.put(&entry).await {
            Ok(()) => {
                inner.metrics.record_write();
                debug!(key = %key, quality, ttl_secs = ttl.as_secs(), "Stored entry");
            }
            Err(e) => self.write_failed(key, &e),
        }
        entry
    }

    // =========================================================================
    // Read-through
    // =========================================================================

    /// Look up `key`, fetching from the provider on a miss
    ///
    /// Concurrent misses for one key share a single provider call. Provider
    /// failures surface as `ProviderFailure` and are never cached.
    ///
    /// A miss is reported to the sink once the fetch settles, with the
    /// latency of the whole request including the provider call.
    pub async fn get_or_fetch(&self, key: &CacheKey) -> Result<Resolved> {
        let tracker = LatencyTracker::start();
        let cold = match self.lookup(key, &tracker).await {
            CacheLookup::Hit(hit) => return Ok(Resolved::Cached(hit)),
            CacheLookup::Empty { source } => return Ok(Resolved::ConfirmedEmpty { source }),
            CacheLookup::Miss { cold } => cold,
        };

        let fetched = match self.inner.provider.clone() {
            Some(provider) => self.fetch_and_store(key, provider.as_ref()).await,
            None => Err(Error::ProviderFailure {
                key: key.render(),
                reason: "no provider configured".into(),
            }),
        };
        self.emit_lookup(key, miss_source(cold), &tracker);

        Ok(match fetched? {
            Some(payload) => Resolved::Fetched(payload),
            None => Resolved::FetchedEmpty,
        })
    }

    /// Coalesced provider fetch followed by a positive or negative write
    async fn fetch_and_store(&self, key: &CacheKey, provider: &dyn Provider) -> Result<Option<Value>> {
        let rendered = key.render();
        self.inner
            .coalescer
            .run(&rendered, || async {
                let tracker = LatencyTracker::start();
                let fetched = provider.fetch(&FetchParams::from_key(key)).await;
                let ok = matches!(&fetched, Ok(r) if r.success);
                self.inner.metrics.record_provider_fetch(ok, tracker.elapsed());

                let response = match fetched {
                    Ok(response) if response.success => response,
                    Ok(_) => {
                        return Err(Error::ProviderFailure {
                            key: rendered.clone(),
                            reason: "provider reported failure".into(),
                        })
                    }
                    Err(e @ Error::ProviderFailure { .. }) => return Err(e),
                    Err(e) => {
                        return Err(Error::ProviderFailure {
                            key: rendered.clone(),
                            reason: e.to_string(),
                        })
                    }
                };

                if is_empty_result(&response.payload) {
                    self.set_negative(key).await;
                    return Ok(None);
                }

                let entry = self.store(key, response.payload.clone(), None).await;
                self.inner.edge.put(entry);
                Ok(Some(response.payload))
            })
            .await
    }

    // =========================================================================
    // Background work
    // =========================================================================

    fn spawn_refresh(&self, key: &CacheKey) {
        let Some(provider) = self.inner.provider.clone() else {
            debug!(key = %key, "Serving stale entry; no provider to refresh from");
            return;
        };
        if self.inner.coalescer.is_in_flight(&key.render()) {
            return;
        }

        let router = self.clone();
        let key = key.clone();
        self.inner.tasks.spawn(async move {
            let result = router.fetch_and_store(&key, provider.as_ref()).await;
            router.inner.metrics.record_refresh(result.is_ok());
            if let Err(e) = result {
                warn!(key = %key, error = %e, "Background refresh failed; stale entry kept");
                router.inner.sink.emit(
                    AnalyticsEvent::new(events::CACHE_REFRESH_FAILURE)
                        .label(key.category().as_str())
                        .index(key.query()),
                );
            }
        });
    }

    fn spawn_rehydration(&self, key: &CacheKey) {
        let rendered = key.render();
        if !self.inner.rehydrating.insert(rendered.clone()) {
            return;
        }

        let router = self.clone();
        let category = key.category();
        self.inner.tasks.spawn(async move {
            let _slot = RehydrationSlot {
                inflight: &router.inner.rehydrating,
                key: rendered.clone(),
            };

            let result = router.inner.cold.rehydrate(&rendered).await;
            router.inner.metrics.record_rehydration(result.is_ok());

            let outcome = match &result {
                Ok(Rehydration::Promoted) => "promoted",
                Ok(Rehydration::NotArchived) => "not_archived",
                Err(_) => "failed",
            };
            router.inner.sink.emit(
                AnalyticsEvent::new(events::CACHE_REHYDRATION)
                    .label(category.as_str())
                    .label(outcome)
                    .index(rendered.as_str()),
            );
        });
    }

    /// Wait for spawned refreshes and rehydrations to finish
    pub async fn flush_background(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    /// Background tasks still running
    pub fn background_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    fn emit_lookup(&self, key: &CacheKey, source: &str, tracker: &LatencyTracker) {
        self.inner.sink.emit(AnalyticsEvent::lookup(
            key.category().as_str(),
            source,
            tracker.elapsed_ms(),
            key.query(),
        ));
    }

    fn tier_error(&self, tier: &str, key: &CacheKey, error: &Error) {
        self.inner.metrics.record_tier_error();
        warn!(tier, key = %key, error = %error, "Tier unavailable; treating as miss");
    }

    fn write_failed(&self, key: &CacheKey, error: &Error) {
        self.inner.metrics.record_write_failure();
        warn!(key = %key, error = %error, "Cache write failed");
        self.inner.sink.emit(
            AnalyticsEvent::new(events::CACHE_WRITE_FAILURE)
                .label(key.category().as_str())
                .label(error.kind())
                .index(key.query()),
        );
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn edge(&self) -> &Arc<EdgeTier> {
        &self.inner.edge
    }

    pub fn persistent(&self) -> &Arc<PersistentTier> {
        &self.inner.persistent
    }

    pub fn cold(&self) -> &Arc<ColdTier> {
        &self.inner.cold
    }

    pub fn policy(&self) -> &TtlPolicy {
        self.inner.persistent.policy()
    }

    pub fn clock(&self) -> &SharedClock {
        self.inner.persistent.clock()
    }

    pub fn sink(&self) -> &SharedSink {
        &self.inner.sink
    }

    pub fn provider(&self) -> Option<&Arc<dyn Provider>> {
        self.inner.provider.as_ref()
    }

    /// Keys with a provider fetch in flight
    pub fn in_flight(&self) -> usize {
        self.inner.coalescer.in_flight()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

fn miss_source(cold: bool) -> &'static str {
    if cold {
        sources::COLD
    } else {
        sources::MISS
    }
}

/// Removes a key from the rehydration set on every exit path
struct RehydrationSlot<'a> {
    inflight: &'a DashSet<String>,
    key: String,
}

impl Drop for RehydrationSlot<'_> {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
    }
}

// =============================================================================
// Tests
// =============================================================================
