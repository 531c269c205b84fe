//! Warming Consumer
//!
//! Drains the warming queue with bounded parallelism. For an author job it
//! fetches the bibliography page, stores it, then fetches and stores every
//! listed title. Provider calls go through the shared rate limiter.
//! A failing title is skipped; a failing job is handed back to the queue.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{QueueMessage, WarmingJob, WarmingQueue};
use crate::analytics::{events, AnalyticsEvent};
use crate::cache::{
    is_empty_result, CacheKey, CacheRouter, Category, Namespace, Page, WarmedMarker,
};
use crate::error::{Error, Result};
use crate::provider::{FetchParams, Provider, ProviderResponse};
use crate::ratelimit::RateLimiter;

/// Consumer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Jobs processed in parallel
    pub concurrency: usize,
    /// Messages pulled per receive
    pub batch_size: usize,
    /// Validity of a warmed marker
    pub marker_ttl_secs: u64,
    /// Author page fetched per job
    pub author_page_limit: u32,
    pub author_sort: String,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_size: 10,
            marker_ttl_secs: 90 * 24 * 60 * 60,
            author_page_limit: 100,
            author_sort: "publicationYear".to_string(),
        }
    }
}

/// Result of one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Entries written: the job's own key plus `titles` title entries
    Warmed { titles: usize },
    /// A valid marker exists; nothing fetched
    AlreadyWarmed,
    /// Handed back to the queue
    Failed { reason: String },
}

struct ConsumerInner {
    config: ConsumerConfig,
    router: CacheRouter,
    provider: Arc<dyn Provider>,
    limiter: Arc<RateLimiter>,
    queue: Arc<dyn WarmingQueue>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct WarmingConsumer {
    inner: Arc<ConsumerInner>,
}

impl WarmingConsumer {
    pub fn new(
        config: ConsumerConfig,
        router: CacheRouter,
        provider: Arc<dyn Provider>,
        limiter: Arc<RateLimiter>,
        queue: Arc<dyn WarmingQueue>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            inner: Arc::new(ConsumerInner {
                config,
                router,
                provider,
                limiter,
                queue,
                permits,
            }),
        }
    }

    /// Consume until cancelled or the queue closes
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            concurrency = self.inner.config.concurrency,
            batch_size = self.inner.config.batch_size,
            "Warming consumer started"
        );

        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = self.inner.queue.receive_batch(self.inner.config.batch_size) => batch,
            };

            match batch {
                Ok(messages) => {
                    if let Err(e) = self.process_batch(messages).await {
                        error!(error = %e, "Warming batch aborted");
                    }
                }
                Err(Error::QueueClosed) => break,
                Err(e) => {
                    warn!(error = %e, "Warming queue receive failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        info!("Warming consumer stopped");
    }

    /// Receive and process one batch
    pub async fn run_once(&self) -> Result<Vec<JobOutcome>> {
        let messages = self
            .inner
            .queue
            .receive_batch(self.inner.config.batch_size)
            .await?;
        self.process_batch(messages).await
    }

    /// Process messages, at most `concurrency` at a time
    ///
    /// Each message is acked on success and retried on failure. Outcomes are
    /// returned in completion order.
    pub async fn process_batch(&self, messages: Vec<QueueMessage>) -> Result<Vec<JobOutcome>> {
        let mut join_set = JoinSet::new();

        for message in messages {
            let permit = self
                .inner
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Internal(format!("Failed to acquire warming permit: {}", e)))?;

            let consumer = self.clone();
            join_set.spawn(async move {
                let outcome = consumer.handle(&message).await;
                drop(permit);
                outcome
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Warming task panicked"),
            }
        }
        Ok(outcomes)
    }

    async fn handle(&self, message: &QueueMessage) -> JobOutcome {
        let result = match message.job() {
            Ok(job) => self.warm(&job).await,
            Err(e) => Err(e),
        };

        let queue = &self.inner.queue;
        match result {
            Ok(outcome) => {
                if let Err(e) = queue.ack(message.id).await {
                    warn!(id = %message.id, error = %e, "Failed to ack warming job");
                }
                outcome
            }
            Err(e) => {
                warn!(id = %message.id, attempts = message.attempts, error = %e, "Warming job failed");
                if let Err(e) = queue.retry(message.id).await {
                    warn!(id = %message.id, error = %e, "Failed to return warming job to queue");
                }
                JobOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Warm one job's key and, for authors, each listed title
    #[instrument(skip(self), fields(query = %job.query, category = %job.category))]
    pub async fn warm(&self, job: &WarmingJob) -> Result<JobOutcome> {
        let inner = &self.inner;
        let key = self.job_key(job);
        let rendered = key.render();
        let persistent = inner.router.persistent();

        match persistent
            .get_record::<WarmedMarker>(Namespace::Warmed, &rendered)
            .await
        {
            Ok(Some(marker)) => {
                debug!(warmed_at = %marker.warmed_at, "Already warmed");
                return Ok(JobOutcome::AlreadyWarmed);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Warmed marker unreadable; warming anyway"),
        }

        let response = self
            .fetch(&key)
            .await
            .map_err(|e| Error::WarmingJobFailure {
                query: job.query.clone(),
                reason: e.to_string(),
            })?;

        if is_empty_result(&response.payload) {
            inner.router.set_negative(&key).await;
        } else {
            inner.router.set(&key, response.payload.clone(), None).await;
        }

        let titles = if job.category == Category::Author {
            self.warm_titles(&response.payload).await
        } else {
            0
        };

        let marker = WarmedMarker {
            key: rendered.clone(),
            warmed_at: inner.router.clock().now(),
        };
        let ttl = Duration::from_secs(inner.config.marker_ttl_secs);
        if let Err(e) = persistent
            .put_record(Namespace::Warmed, &rendered, &marker, ttl)
            .await
        {
            warn!(error = %e, "Failed to write warmed marker");
        }

        inner.router.sink().emit(
            AnalyticsEvent::new(events::CACHE_WARMING)
                .label(job.category.as_str())
                .value(titles as f64)
                .value(job.priority as f64)
                .index(job.query.as_str()),
        );

        info!(titles, "Warmed");
        Ok(JobOutcome::Warmed { titles })
    }

    async fn warm_titles(&self, author_payload: &Value) -> usize {
        let Some(works) = author_payload.get("works").and_then(Value::as_array) else {
            return 0;
        };

        let mut warmed = 0;
        for title in works
            .iter()
            .filter_map(|w| w.get("title").and_then(Value::as_str))
        {
            let key = CacheKey::title(title);
            match self.fetch(&key).await {
                Ok(response) if is_empty_result(&response.payload) => {
                    self.inner.router.set_negative(&key).await;
                }
                Ok(response) => {
                    self.inner.router.set(&key, response.payload, None).await;
                    warmed += 1;
                }
                Err(e) => debug!(title, error = %e, "Skipping title"),
            }
        }
        warmed
    }

    /// Rate-limited provider fetch; `success == false` is an error
    async fn fetch(&self, key: &CacheKey) -> Result<ProviderResponse> {
        self.inner.limiter.acquire().await;
        let response = self.inner.provider.fetch(&FetchParams::from_key(key)).await?;
        if !response.success {
            return Err(Error::ProviderFailure {
                key: key.render(),
                reason: "provider reported failure".into(),
            });
        }
        Ok(response)
    }

    fn job_key(&self, job: &WarmingJob) -> CacheKey {
        match job.category {
            Category::Author => CacheKey::paged(
                Category::Author,
                &job.query,
                Page::new(
                    0,
                    self.inner.config.author_page_limit,
                    self.inner.config.author_sort.as_str(),
                ),
            ),
            category => CacheKey::new(category, &job.query),
        }
    }
}
