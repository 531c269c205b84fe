//! Engine configuration
//!
//! One YAML document with a section per component. Every field has a
//! default, so a file only needs to name what it overrides:
//!
//! ```yaml
//! ttl:
//!   title_secs: 86400
//! edge:
//!   windows: { fresh_secs: 600, stale_secs: 3600 }
//! alerts:
//!   webhook_url: https://hooks.example.com/cache
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::AlertConfig;
use crate::cache::{ColdConfig, EdgeConfig, RouterConfig, TtlPolicy};
use crate::error::{Error, Result};
use crate::provider::HttpProviderConfig;
use crate::ratelimit::RateLimiterConfig;
use crate::warming::{AnalyzerConfig, ConsumerConfig, QueueConfig};

/// Job schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub analyzer_interval_secs: u64,
    pub alert_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            analyzer_interval_secs: 24 * 60 * 60,
            alert_interval_secs: 15 * 60,
        }
    }
}

impl ScheduleConfig {
    pub fn analyzer_interval(&self) -> Duration {
        Duration::from_secs(self.analyzer_interval_secs)
    }

    pub fn alert_interval(&self) -> Duration {
        Duration::from_secs(self.alert_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub ttl: TtlPolicy,
    pub edge: EdgeConfig,
    pub cold: ColdConfig,
    pub router: RouterConfig,
    pub provider: HttpProviderConfig,
    pub rate_limit: RateLimiterConfig,
    pub analyzer: AnalyzerConfig,
    pub consumer: ConsumerConfig,
    pub queue: QueueConfig,
    pub alerts: AlertConfig,
    pub schedule: ScheduleConfig,
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<()> {
        let weights = &self.ttl.weights;
        let sum = weights.isbn + weights.cover + weights.description;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!(
                "quality weights must sum to 1.0, got {}",
                sum
            )));
        }
        if self.ttl.low_quality > self.ttl.high_quality {
            return Err(Error::Config(
                "ttl.low_quality must not exceed ttl.high_quality".into(),
            ));
        }
        if self.rate_limit.rate_per_sec <= 0.0 {
            return Err(Error::Config("rate_limit.rate_per_sec must be positive".into()));
        }
        if self.consumer.concurrency == 0 || self.consumer.batch_size == 0 {
            return Err(Error::Config(
                "consumer.concurrency and consumer.batch_size must be at least 1".into(),
            ));
        }
        if self.queue.max_attempts == 0 {
            return Err(Error::Config("queue.max_attempts must be at least 1".into()));
        }
        if self.schedule.analyzer_interval_secs == 0 || self.schedule.alert_interval_secs == 0 {
            return Err(Error::Config("schedule intervals must be non-zero".into()));
        }
        Ok(())
    }
}
