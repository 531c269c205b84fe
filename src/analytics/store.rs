//! Aggregating metrics store
//!
//! The read side of analytics: trailing-window request counts per query
//! (consumed by the warming analyzer) and hit-rate / latency summaries
//! (consumed by the alert monitor).

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{events, sources, AnalyticsEvent, MetricsSink};
use crate::clock::SharedClock;
use crate::error::Result;

/// Requests per `(category, query)` over a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCount {
    pub category: String,
    pub query: String,
    pub total_requests: u64,
}

impl QueryCount {
    pub fn new(category: impl Into<String>, query: impl Into<String>, total_requests: u64) -> Self {
        Self {
            category: category.into(),
            query: query.into(),
            total_requests,
        }
    }
}

/// Lookup outcome summary over a window. Rates are percentages (0 - 100).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub total_requests: u64,
    pub edge_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub edge_hit_rate: f64,
    pub combined_hit_rate: f64,
    /// `100 - combined_hit_rate`
    pub miss_rate: f64,
    pub p99_latency_ms: f64,
}

impl CacheSummary {
    /// Summarise `(source, latency_ms)` samples
    pub fn from_samples<'a>(samples: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let mut summary = CacheSummary::default();
        let mut latencies = Vec::new();

        for (source, latency_ms) in samples {
            summary.total_requests += 1;
            match source {
                sources::EDGE_FRESH | sources::EDGE_STALE => summary.edge_hits += 1,
                sources::PERSISTENT => summary.persistent_hits += 1,
                _ => summary.misses += 1,
            }
            latencies.push(latency_ms);
        }

        if summary.total_requests == 0 {
            return summary;
        }

        let total = summary.total_requests as f64;
        summary.edge_hit_rate = summary.edge_hits as f64 / total * 100.0;
        summary.combined_hit_rate =
            (summary.edge_hits + summary.persistent_hits) as f64 / total * 100.0;
        summary.miss_rate = 100.0 - summary.combined_hit_rate;
        summary.p99_latency_ms = percentile(&mut latencies, 0.99);
        summary
    }

    pub fn has_traffic(&self) -> bool {
        self.total_requests > 0
    }
}

/// Nearest-rank percentile
fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let rank = (p * values.len() as f64).ceil() as usize;
    values[rank.clamp(1, values.len()) - 1]
}

/// Aggregate query interface over recorded events
#[async_trait]
pub trait MetricsStore: Send + Sync {
    /// Lookups since `since`, grouped by `(category, query)`
    async fn request_counts(&self, since: DateTime<Utc>) -> Result<Vec<QueryCount>>;

    /// Lookup outcome summary since `since`
    async fn cache_summary(&self, since: DateTime<Utc>) -> Result<CacheSummary>;
}

/// In-memory event log that is both sink and store
pub struct InMemoryMetricsStore {
    events: Mutex<VecDeque<(DateTime<Utc>, AnalyticsEvent)>>,
    clock: SharedClock,
    max_events: usize,
}

impl InMemoryMetricsStore {
    /// Default bound on retained events
    pub const DEFAULT_MAX_EVENTS: usize = 1_000_000;

    pub fn new(clock: SharedClock) -> Self {
        Self::with_capacity(clock, Self::DEFAULT_MAX_EVENTS)
    }

    /// Keep at most `max_events`, dropping the oldest
    pub fn with_capacity(clock: SharedClock, max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            clock,
            max_events: max_events.max(1),
        }
    }

    /// Record `count` lookups of one query from one source
    pub fn record_lookups(
        &self,
        category: &str,
        query: &str,
        source: &str,
        count: u64,
        latency_ms: f64,
    ) {
        for _ in 0..count {
            self.emit(AnalyticsEvent::lookup(category, source, latency_ms, query));
        }
    }

    /// Recorded events with the given name
    pub fn events_named(&self, name: &str) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(_, e)| e.name == name)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Drop events older than `before`
    pub fn prune(&self, before: DateTime<Utc>) -> usize {
        let mut events = self.events.lock();
        let start = events.len();
        events.retain(|(at, _)| *at >= before);
        start - events.len()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    fn lookups_since(&self, since: DateTime<Utc>) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(at, e)| *at >= since && e.name == events::CACHE_LOOKUP)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl MetricsSink for InMemoryMetricsStore {
    fn emit(&self, event: AnalyticsEvent) {
        let now = self.clock.now();
        let mut events = self.events.lock();
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back((now, event));
    }
}

#[async_trait]
impl MetricsStore for InMemoryMetricsStore {
    async fn request_counts(&self, since: DateTime<Utc>) -> Result<Vec<QueryCount>> {
        let mut counts: HashMap<(String, String), u64> = HashMap::new();
        for event in self.lookups_since(since) {
            let (Some(category), Some(query)) = (event.label_at(0), event.index_at(0)) else {
                continue;
            };
            *counts
                .entry((category.to_string(), query.to_string()))
                .or_insert(0) += 1;
        }

        Ok(counts
            .into_iter()
            .map(|((category, query), total)| QueryCount::new(category, query, total))
            .collect())
    }

    async fn cache_summary(&self, since: DateTime<Utc>) -> Result<CacheSummary> {
        let lookups = self.lookups_since(since);
        Ok(CacheSummary::from_samples(lookups.iter().map(|e| {
            (
                e.label_at(1).unwrap_or(sources::MISS),
                e.value_at(0).unwrap_or(0.0),
            )
        })))
    }
}
