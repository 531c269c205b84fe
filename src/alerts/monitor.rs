//! Alert Monitor
//!
//! Evaluation is a function of `now` and the metrics store. The alert record
//! is written only after the notifier confirms delivery, so a failed send is
//! retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{alert_type_set_key, Alert, AlertNotifier, AlertThresholds};
use crate::analytics::{events, AnalyticsEvent, MetricsStore, SharedSink};
use crate::cache::{AlertRecord, Namespace, PersistentTier};
use crate::error::{Error, Result};

/// Monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Trailing window summarised on each run
    pub window_secs: u64,
    /// Suppression period for an identical alert type set
    pub cooldown_secs: u64,
    pub thresholds: AlertThresholds,
    /// Webhook receiving alerts; alerts are only logged when unset
    pub webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            window_secs: 15 * 60,
            cooldown_secs: 4 * 60 * 60,
            thresholds: AlertThresholds::default(),
            webhook_url: None,
        }
    }
}

impl AlertConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Result of one evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum AlertOutcome {
    /// No lookups in the window
    NoTraffic,
    Healthy,
    /// Same alert type set sent within the cooldown
    Suppressed { key: String },
    Sent(Alert),
}

pub struct AlertMonitor {
    config: AlertConfig,
    store: Arc<dyn MetricsStore>,
    records: Arc<PersistentTier>,
    notifier: Arc<dyn AlertNotifier>,
    sink: SharedSink,
}

impl AlertMonitor {
    pub fn new(
        config: AlertConfig,
        store: Arc<dyn MetricsStore>,
        records: Arc<PersistentTier>,
        notifier: Arc<dyn AlertNotifier>,
        sink: SharedSink,
    ) -> Self {
        Self {
            config,
            store,
            records,
            notifier,
            sink,
        }
    }

    /// Evaluate the window ending at `now` and notify if needed
    #[instrument(skip(self))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<AlertOutcome> {
        let window = to_chrono(self.config.window())?;
        let summary = self.store.cache_summary(now - window).await?;
        if !summary.has_traffic() {
            debug!("No traffic in window; skipping alert evaluation");
            return Ok(AlertOutcome::NoTraffic);
        }

        let triggered = self.config.thresholds.evaluate(&summary);
        if triggered.is_empty() {
            debug!(
                miss_rate = summary.miss_rate,
                edge_hit_rate = summary.edge_hit_rate,
                p99_ms = summary.p99_latency_ms,
                "Cache healthy"
            );
            return Ok(AlertOutcome::Healthy);
        }

        let key = alert_type_set_key(&triggered);
        if self.in_cooldown(&key, now).await? {
            debug!(alert = %key, "Alert suppressed by cooldown");
            return Ok(AlertOutcome::Suppressed { key });
        }

        let alert = Alert::new(triggered, summary, self.config.window_secs, now);
        self.notifier.send(&alert).await.map_err(|e| match e {
            Error::AlertDeliveryFailure(_) => e,
            other => Error::AlertDeliveryFailure(other.to_string()),
        })?;

        let record = AlertRecord {
            alert_type_set_key: key.clone(),
            last_sent_at: now,
        };
        if let Err(e) = self
            .records
            .put_record(Namespace::Alert, &key, &record, self.config.cooldown())
            .await
        {
            warn!(alert = %key, error = %e, "Failed to write alert record");
        }

        self.sink.emit(
            AnalyticsEvent::new(events::CACHE_ALERT)
                .label(alert.severity.as_str())
                .label(key.as_str())
                .value(alert.summary.miss_rate)
                .value(alert.summary.edge_hit_rate)
                .value(alert.summary.p99_latency_ms),
        );

        info!(alert = %key, severity = %alert.severity, "Alert sent");
        Ok(AlertOutcome::Sent(alert))
    }

    async fn in_cooldown(&self, key: &str, now: DateTime<Utc>) -> Result<bool> {
        let record = match self
            .records
            .get_record::<AlertRecord>(Namespace::Alert, key)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(alert = %key, error = %e, "Alert record unreadable; sending anyway");
                None
            }
        };

        let cooldown = to_chrono(self.config.cooldown())?;
        Ok(record.is_some_and(|r| now - r.last_sent_at < cooldown))
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| Error::Config(format!("invalid duration {:?}: {}", duration, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertSeverity, RecordingNotifier};
    use crate::analytics::{sources, InMemoryMetricsStore, NullSink};
    use crate::cache::{InMemoryKvStore, TtlPolicy};
    use crate::clock::{Clock, ManualClock};
    use assert_matches::assert_matches;

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryMetricsStore>,
        notifier: Arc<RecordingNotifier>,
        monitor: AlertMonitor,
    }

    fn make_monitor() -> Fixture {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryMetricsStore::new(clock.clone()));
        let notifier = Arc::new(RecordingNotifier::new());
        let records = Arc::new(PersistentTier::new(
            Arc::new(InMemoryKvStore::new(clock.clone())),
            TtlPolicy::default(),
            clock.clone(),
        ));
        let monitor = AlertMonitor::new(
            AlertConfig::default(),
            store.clone(),
            records,
            notifier.clone(),
            Arc::new(NullSink),
        );
        Fixture {
            clock,
            store,
            notifier,
            monitor,
        }
    }

    /// 80 edge hits, 20 misses: miss 20%, edge 80%
    fn record_degraded_traffic(store: &InMemoryMetricsStore) {
        store.record_lookups("title", "dune", sources::EDGE_FRESH, 80, 2.0);
        store.record_lookups("title", "dune", sources::MISS, 20, 40.0);
    }

    #[tokio::test]
    async fn test_no_traffic_skips_evaluation() {
        let fx = make_monitor();
        assert_eq!(
            fx.monitor.run(fx.clock.now()).await.unwrap(),
            AlertOutcome::NoTraffic
        );
    }

    #[tokio::test]
    async fn test_healthy_window() {
        let fx = make_monitor();
        fx.store.record_lookups("title", "dune", sources::EDGE_FRESH, 95, 2.0);
        fx.store.record_lookups("title", "dune", sources::PERSISTENT, 5, 20.0);

        assert_eq!(
            fx.monitor.run(fx.clock.now()).await.unwrap(),
            AlertOutcome::Healthy
        );
    }

    #[tokio::test]
    async fn test_alert_sent_then_suppressed_then_resent_after_cooldown() {
        let fx = make_monitor();
        record_degraded_traffic(&fx.store);

        let sent = fx.monitor.run(fx.clock.now()).await.unwrap();
        assert_matches!(&sent, AlertOutcome::Sent(alert) if alert.severity == AlertSeverity::Critical);

        fx.clock.advance(Duration::from_secs(15 * 60));
        record_degraded_traffic(&fx.store);
        assert_matches!(
            fx.monitor.run(fx.clock.now()).await.unwrap(),
            AlertOutcome::Suppressed { .. }
        );

        fx.clock.advance(Duration::from_secs(4 * 60 * 60));
        record_degraded_traffic(&fx.store);
        assert_matches!(
            fx.monitor.run(fx.clock.now()).await.unwrap(),
            AlertOutcome::Sent(_)
        );

        assert_eq!(fx.notifier.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_next_tick() {
        let fx = make_monitor();
        record_degraded_traffic(&fx.store);

        fx.notifier.set_failing(true);
        assert_matches!(
            fx.monitor.run(fx.clock.now()).await,
            Err(Error::AlertDeliveryFailure(_))
        );

        fx.notifier.set_failing(false);
        assert_matches!(
            fx.monitor.run(fx.clock.now()).await.unwrap(),
            AlertOutcome::Sent(_)
        );
    }

    #[tokio::test]
    async fn test_different_type_set_is_not_suppressed() {
        let fx = make_monitor();
        record_degraded_traffic(&fx.store);
        fx.monitor.run(fx.clock.now()).await.unwrap();

        // Next window: only the edge hit rate is low
        fx.clock.advance(Duration::from_secs(16 * 60));
        fx.store.record_lookups("title", "dune", sources::EDGE_FRESH, 70, 2.0);
        fx.store.record_lookups("title", "dune", sources::PERSISTENT, 30, 20.0);

        let outcome = fx.monitor.run(fx.clock.now()).await.unwrap();
        assert_matches!(outcome, AlertOutcome::Sent(alert) if alert.severity == AlertSeverity::Warning);
    }
}
