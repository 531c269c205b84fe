//! Cache Metrics Collection
//!
//! In-process counters and latency averages for the router. These back
//! `CacheRouter::metrics()` and complement the analytics events sent to the
//! metrics sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Lookup outcomes
    edge_fresh_hits: AtomicU64,
    edge_stale_hits: AtomicU64,
    persistent_hits: AtomicU64,
    negative_hits: AtomicU64,
    cold_misses: AtomicU64,
    misses: AtomicU64,

    // Writes
    writes: AtomicU64,
    write_failures: AtomicU64,
    tier_errors: AtomicU64,

    // Background work
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
    rehydrations: AtomicU64,
    rehydration_failures: AtomicU64,

    // Provider fetches issued by the router
    provider_fetches: AtomicU64,
    provider_failures: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    edge_latency_us: AtomicU64,
    persistent_latency_us: AtomicU64,
    provider_latency_us: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // Lookup outcomes
    pub fn record_edge_hit(&self, stale: bool) {
        if stale {
            self.edge_stale_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.edge_fresh_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_persistent_hit(&self) {
        self.persistent_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Negative entries served; already counted as an edge or persistent hit
    pub fn record_negative_hit(&self) {
        self.negative_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self, cold: bool) {
        if cold {
            self.cold_misses.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn edge_hits(&self) -> u64 {
        self.edge_fresh_hits.load(Ordering::Relaxed) + self.edge_stale_hits.load(Ordering::Relaxed)
    }

    pub fn persistent_hits(&self) -> u64 {
        self.persistent_hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    // Writes
    pub fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_error(&self) {
        self.tier_errors.fetch_add(1, Ordering::Relaxed);
    }

    // Background work
    pub fn record_refresh(&self, ok: bool) {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_rehydration(&self, ok: bool) {
        self.rehydrations.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.rehydration_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_provider_fetch(&self, ok: bool, duration: Duration) {
        self.provider_fetches.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.provider_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.update_latency_ema(&self.provider_latency_us, duration);
    }

    // Latency tracking
    pub fn record_edge_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.edge_latency_us, duration);
    }

    pub fn record_persistent_latency(&self, duration: Duration) {
        self.update_latency_ema(&self.persistent_latency_us, duration);
    }

    fn update_latency_ema(&self, target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1;

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Share of lookups answered by the edge or persistent tier
    pub fn overall_hit_ratio(&self) -> f64 {
        let hits = self.edge_hits() + self.persistent_hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            edge_fresh_hits: load(&self.edge_fresh_hits),
            edge_stale_hits: load(&self.edge_stale_hits),
            persistent_hits: load(&self.persistent_hits),
            negative_hits: load(&self.negative_hits),
            cold_misses: load(&self.cold_misses),
            misses: load(&self.misses),
            writes: load(&self.writes),
            write_failures: load(&self.write_failures),
            tier_errors: load(&self.tier_errors),
            refreshes: load(&self.refreshes),
            refresh_failures: load(&self.refresh_failures),
            rehydrations: load(&self.rehydrations),
            rehydration_failures: load(&self.rehydration_failures),
            provider_fetches: load(&self.provider_fetches),
            provider_failures: load(&self.provider_failures),
            edge_latency: Duration::from_micros(load(&self.edge_latency_us)),
            persistent_latency: Duration::from_micros(load(&self.persistent_latency_us)),
            provider_latency: Duration::from_micros(load(&self.provider_latency_us)),
            overall_hit_ratio: self.overall_hit_ratio(),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.edge_fresh_hits,
            &self.edge_stale_hits,
            &self.persistent_hits,
            &self.negative_hits,
            &self.cold_misses,
            &self.misses,
            &self.writes,
            &self.write_failures,
            &self.tier_errors,
            &self.refreshes,
            &self.refresh_failures,
            &self.rehydrations,
            &self.rehydration_failures,
            &self.provider_fetches,
            &self.provider_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of router metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub edge_fresh_hits: u64,
    pub edge_stale_hits: u64,
    pub persistent_hits: u64,
    pub negative_hits: u64,
    pub cold_misses: u64,
    pub misses: u64,

    pub writes: u64,
    pub write_failures: u64,
    pub tier_errors: u64,

    pub refreshes: u64,
    pub refresh_failures: u64,
    pub rehydrations: u64,
    pub rehydration_failures: u64,

    pub provider_fetches: u64,
    pub provider_failures: u64,

    pub edge_latency: Duration,
    pub persistent_latency: Duration,
    pub provider_latency: Duration,

    pub overall_hit_ratio: f64,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time in fractional milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

// =============================================================================
// Tests
// =============================================================================
