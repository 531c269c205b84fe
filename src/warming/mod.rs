//! Predictive Cache Warming
//!
//! A daily analyzer picks popular author queries out of the metrics store
//! and enqueues them as jobs. A bounded-parallel consumer drains the queue,
//! fetches each author's bibliography through the provider and populates the
//! router with the author page and one title entry per work.
//!
//! ```text
//! MetricsStore → WarmingAnalyzer → WarmingQueue → WarmingConsumer → CacheRouter
//! ```

mod analyzer;
mod consumer;
mod queue;

pub use analyzer::{select_candidates, AnalyzerConfig, WarmingAnalyzer};
pub use consumer::{ConsumerConfig, JobOutcome, WarmingConsumer};
pub use queue::{InMemoryWarmingQueue, QueueConfig, QueueMessage, WarmingQueue};

use serde::{Deserialize, Serialize};

use crate::cache::Category;

/// Query selected for warming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingCandidate {
    pub query: String,
    pub category: Category,
    pub total_requests: u64,
    pub priority: u64,
}

impl WarmingCandidate {
    pub fn to_job(&self) -> WarmingJob {
        WarmingJob {
            query: self.query.clone(),
            category: self.category,
            priority: self.priority,
        }
    }
}

/// Queue message body: `{"query", "category", "priority"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmingJob {
    pub query: String,
    pub category: Category,
    pub priority: u64,
}
