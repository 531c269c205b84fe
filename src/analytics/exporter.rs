//! Prometheus exposition for analytics events

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use super::{events, AnalyticsEvent, MetricsSink};
use crate::error::{Error, Result};

/// Sink folding analytics events into a Prometheus registry
pub struct PrometheusSink {
    registry: Registry,
    lookups: IntCounterVec,
    lookup_latency: HistogramVec,
    events: IntCounterVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    pub fn with_registry(registry: Registry) -> Result<Self> {
        let lookups = IntCounterVec::new(
            Opts::new("tomecache_lookups_total", "Cache lookups by category and source"),
            &["category", "source"],
        )
        .map_err(metrics_error)?;

        let lookup_latency = HistogramVec::new(
            HistogramOpts::new(
                "tomecache_lookup_latency_seconds",
                "Cache lookup latency by source",
            )
            .buckets(vec![
                0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5,
            ]),
            &["source"],
        )
        .map_err(metrics_error)?;

        let events = IntCounterVec::new(
            Opts::new("tomecache_events_total", "Analytics events by name"),
            &["event"],
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(lookups.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(lookup_latency.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(events.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            lookups,
            lookup_latency,
            events,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the registry in text exposition format
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("prometheus: {}", e))
}

impl MetricsSink for PrometheusSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.with_label_values(&[event.name.as_str()]).inc();

        if event.name == events::CACHE_LOOKUP {
            let category = event.label_at(0).unwrap_or("unknown");
            let source = event.label_at(1).unwrap_or("unknown");
            self.lookups.with_label_values(&[category, source]).inc();
            if let Some(ms) = event.value_at(0) {
                self.lookup_latency
                    .with_label_values(&[source])
                    .observe(ms / 1000.0);
            }
        }
    }
}
