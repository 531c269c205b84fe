//! Threshold Alerting
//!
//! Every 15 minutes the monitor summarises the trailing window and checks it
//! against two severities of thresholds. Notifications are deduplicated by
//! the set of triggered alert types with a cooldown.

mod monitor;
mod notifier;

pub use monitor::{AlertConfig, AlertMonitor, AlertOutcome};
pub use notifier::{AlertNotifier, LoggingNotifier, RecordingNotifier, WebhookNotifier};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analytics::CacheSummary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighMissRate,
    LowEdgeHitRate,
    CriticalMissRate,
    HighP99Latency,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighMissRate => "high_miss_rate",
            AlertType::LowEdgeHitRate => "low_edge_hit_rate",
            AlertType::CriticalMissRate => "critical_miss_rate",
            AlertType::HighP99Latency => "high_p99_latency",
        }
    }

    pub fn severity(&self) -> AlertSeverity {
        match self {
            AlertType::HighMissRate | AlertType::LowEdgeHitRate => AlertSeverity::Warning,
            AlertType::CriticalMissRate | AlertType::HighP99Latency => AlertSeverity::Critical,
        }
    }
}

/// Thresholds. Rates are percentages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub warning_miss_rate: f64,
    pub warning_edge_hit_rate: f64,
    pub critical_miss_rate: f64,
    pub critical_p99_ms: f64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning_miss_rate: 10.0,
            warning_edge_hit_rate: 75.0,
            critical_miss_rate: 15.0,
            critical_p99_ms: 500.0,
        }
    }
}

impl AlertThresholds {
    /// Alert types triggered by a summary, sorted
    pub fn evaluate(&self, summary: &CacheSummary) -> Vec<AlertType> {
        let mut triggered = Vec::new();
        if summary.miss_rate > self.warning_miss_rate {
            triggered.push(AlertType::HighMissRate);
        }
        if summary.edge_hit_rate < self.warning_edge_hit_rate {
            triggered.push(AlertType::LowEdgeHitRate);
        }
        if summary.miss_rate > self.critical_miss_rate {
            triggered.push(AlertType::CriticalMissRate);
        }
        if summary.p99_latency_ms > self.critical_p99_ms {
            triggered.push(AlertType::HighP99Latency);
        }
        triggered.sort();
        triggered
    }
}

/// Deduplication key for a set of alert types
pub fn alert_type_set_key(types: &[AlertType]) -> String {
    let mut names: Vec<&str> = types.iter().map(AlertType::as_str).collect();
    names.sort_unstable();
    names.dedup();
    names.join(",")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub severity: AlertSeverity,
    pub types: Vec<AlertType>,
    pub summary: CacheSummary,
    pub window_secs: u64,
    pub triggered_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        types: Vec<AlertType>,
        summary: CacheSummary,
        window_secs: u64,
        triggered_at: DateTime<Utc>,
    ) -> Self {
        let severity = types
            .iter()
            .map(AlertType::severity)
            .max()
            .unwrap_or(AlertSeverity::Warning);
        Self {
            severity,
            types,
            summary,
            window_secs,
            triggered_at,
        }
    }

    pub fn dedupe_key(&self) -> String {
        alert_type_set_key(&self.types)
    }

    /// One-line human summary
    pub fn message(&self) -> String {
        format!(
            "[{}] {} over {}m: miss {:.1}%, edge hit {:.1}%, p99 {:.0}ms ({} requests)",
            self.severity.as_str().to_uppercase(),
            self.dedupe_key(),
            self.window_secs / 60,
            self.summary.miss_rate,
            self.summary.edge_hit_rate,
            self.summary.p99_latency_ms,
            self.summary.total_requests
        )
    }
}
