//! Warming Analyzer
//!
//! Runs once a day. Picks the most requested author queries from the trailing
//! window and enqueues them. Does no fetching itself.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use super::{WarmingCandidate, WarmingQueue};
use crate::analytics::{MetricsStore, QueryCount};
use crate::cache::Category;
use crate::error::{Error, Result};

/// Analyzer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Trailing window queried from the metrics store
    pub lookback_secs: u64,
    /// Minimum requests in the window for a query to qualify
    pub min_requests: u64,
    /// Candidates kept per run
    pub top_n: usize,
    /// Only queries of this category are warmed
    pub category: Category,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            lookback_secs: 24 * 60 * 60,
            min_requests: 5,
            top_n: 20,
            category: Category::Author,
        }
    }
}

impl AnalyzerConfig {
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.lookback_secs)
    }
}

/// Filter, rank and truncate request counts into candidates
///
/// Ties keep the order the store returned them in.
pub fn select_candidates(counts: &[QueryCount], config: &AnalyzerConfig) -> Vec<WarmingCandidate> {
    let mut selected: Vec<&QueryCount> = counts
        .iter()
        .filter(|c| c.category == config.category.as_str())
        .filter(|c| c.total_requests >= config.min_requests)
        .collect();

    selected.sort_by(|a, b| b.total_requests.cmp(&a.total_requests));

    selected
        .into_iter()
        .take(config.top_n)
        .map(|c| WarmingCandidate {
            query: c.query.clone(),
            category: config.category,
            total_requests: c.total_requests,
            priority: c.total_requests,
        })
        .collect()
}

pub struct WarmingAnalyzer {
    config: AnalyzerConfig,
    store: Arc<dyn MetricsStore>,
    queue: Arc<dyn WarmingQueue>,
}

impl WarmingAnalyzer {
    pub fn new(
        config: AnalyzerConfig,
        store: Arc<dyn MetricsStore>,
        queue: Arc<dyn WarmingQueue>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
        }
    }

    /// Candidates for the window ending at `now`
    pub async fn analyze(&self, now: DateTime<Utc>) -> Result<Vec<WarmingCandidate>> {
        let lookback = chrono::Duration::from_std(self.config.lookback())
            .map_err(|e| Error::Config(format!("invalid lookback: {}", e)))?;
        let counts = self.store.request_counts(now - lookback).await?;
        debug!(queries = counts.len(), "Loaded request counts");
        Ok(select_candidates(&counts, &self.config))
    }

    /// Analyze and enqueue one job per candidate. Returns the number enqueued.
    #[instrument(skip(self), fields(category = %self.config.category))]
    pub async fn run(&self, now: DateTime<Utc>) -> Result<usize> {
        let candidates = self.analyze(now).await?;
        if candidates.is_empty() {
            info!("No warming candidates");
            return Ok(0);
        }

        let jobs: Vec<_> = candidates.iter().map(WarmingCandidate::to_job).collect();
        self.queue.send_batch(&jobs).await?;

        info!(
            count = jobs.len(),
            top = %candidates[0].query,
            top_requests = candidates[0].total_requests,
            "Enqueued warming candidates"
        );
        Ok(jobs.len())
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }
}
