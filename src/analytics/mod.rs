//! Analytics Events
//!
//! Fire-and-forget event emission used by every tier and job. An event is
//! `(name, labels[], values[], indexes[])`, the shape an analytics engine
//! dataset accepts. Emission is synchronous, infallible and never blocks a
//! lookup; a missing or broken sink must not affect cache behavior.
//!
//! # Sinks
//!
//! - [`NullSink`] - drops everything
//! - [`TracingSink`] - logs events at debug level
//! - [`FanoutSink`] - forwards to several sinks
//! - [`InMemoryMetricsStore`] - records events and answers aggregate queries
//! - [`PrometheusSink`] - folds events into a Prometheus registry

mod exporter;
mod store;

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

pub use exporter::PrometheusSink;
pub use store::{CacheSummary, InMemoryMetricsStore, MetricsStore, QueryCount};

/// Well-known event names
pub mod events {
    /// One router lookup: labels `[category, source]`, values `[latency_ms]`, indexes `[query]`
    pub const CACHE_LOOKUP: &str = "cache_lookup";
    /// Persistent write swallowed on the hot path: labels `[category, error_kind]`
    pub const CACHE_WRITE_FAILURE: &str = "cache_write_failure";
    /// Stale-triggered refresh failed: labels `[category]`
    pub const CACHE_REFRESH_FAILURE: &str = "cache_refresh_failure";
    /// Rehydration attempt: labels `[category, outcome]`
    pub const CACHE_REHYDRATION: &str = "cache_rehydration";
    /// Warming candidate processed: labels `[category, outcome]`, values `[titles_cached]`
    pub const CACHE_WARMING: &str = "cache_warming";
    /// Alert emitted: labels `[severity, alert_types]`, values `[miss_rate, p99_ms]`
    pub const CACHE_ALERT: &str = "cache_alert";
}

/// Lookup source labels
pub mod sources {
    pub const EDGE_FRESH: &str = "edge_fresh";
    pub const EDGE_STALE: &str = "edge_stale";
    pub const PERSISTENT: &str = "persistent";
    /// Cold index hit; still a miss for the caller
    pub const COLD: &str = "cold";
    pub const MISS: &str = "miss";
}

/// Analytics event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    pub name: String,
    /// Dimension labels
    pub labels: Vec<String>,
    /// Numeric values
    pub values: Vec<f64>,
    /// Index labels (sampling / grouping keys)
    pub indexes: Vec<String>,
}

impl AnalyticsEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: Vec::new(),
            values: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn value(mut self, value: f64) -> Self {
        self.values.push(value);
        self
    }

    pub fn index(mut self, index: impl Into<String>) -> Self {
        self.indexes.push(index.into());
        self
    }

    /// Router lookup event
    pub fn lookup(category: &str, source: &str, latency_ms: f64, query: &str) -> Self {
        Self::new(events::CACHE_LOOKUP)
            .label(category)
            .label(source)
            .value(latency_ms)
            .index(query)
    }

    pub fn label_at(&self, i: usize) -> Option<&str> {
        self.labels.get(i).map(String::as_str)
    }

    pub fn value_at(&self, i: usize) -> Option<f64> {
        self.values.get(i).copied()
    }

    pub fn index_at(&self, i: usize) -> Option<&str> {
        self.indexes.get(i).map(String::as_str)
    }
}

/// Fire-and-forget event sink
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// Sink that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// Sink that logs events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn emit(&self, event: AnalyticsEvent) {
        debug!(
            event = %event.name,
            labels = ?event.labels,
            values = ?event.values,
            indexes = ?event.indexes,
            "analytics event"
        );
    }
}

/// Sink forwarding to several sinks
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl MetricsSink for FanoutSink {
    fn emit(&self, event: AnalyticsEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// Shared sink handle
pub type SharedSink = Arc<dyn MetricsSink>;
