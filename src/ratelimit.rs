//! Token-Bucket Rate Limiter
//!
//! Throttles bursts of outbound provider calls. Capacity equals the rate;
//! tokens refill continuously from elapsed time. A caller that finds the
//! bucket empty sleeps until the next token is due plus a random jitter so
//! that parallel callers do not wake in lockstep.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

/// Rate limiter configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Tokens per second; also the bucket capacity
    pub rate_per_sec: f64,
    /// Jitter bound in milliseconds (applied as ±jitter)
    pub jitter_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: 10.0,
            jitter_ms: 100,
        }
    }
}

/// Bucket state
#[derive(Debug, Clone)]
pub struct RateBucket {
    pub tokens: f64,
    pub last_refill_at: Instant,
}

impl RateBucket {
    fn refill(&mut self, rate: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(rate);
        self.last_refill_at = now;
    }
}

/// Token-bucket limiter for one resource
pub struct RateLimiter {
    name: String,
    config: RateLimiterConfig,
    bucket: Mutex<RateBucket>,
    acquired: AtomicU64,
    throttled: AtomicU64,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimiterConfig) -> Self {
        let rate = config.rate_per_sec.max(f64::MIN_POSITIVE);
        let config = RateLimiterConfig {
            rate_per_sec: rate,
            ..config
        };
        Self {
            name: name.into(),
            bucket: Mutex::new(RateBucket {
                tokens: rate,
                last_refill_at: Instant::now(),
            }),
            config,
            acquired: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    /// Take one token if available, without waiting
    pub fn try_acquire(&self) -> bool {
        self.take_or_wait().is_none()
    }

    /// Take one token, sleeping while the bucket is empty
    pub async fn acquire(&self) {
        let mut throttled = false;
        while let Some(wait) = self.take_or_wait() {
            if !throttled {
                self.throttled.fetch_add(1, Ordering::Relaxed);
                throttled = true;
            }
            let sleep = self.jittered(wait);
            trace!(limiter = %self.name, wait_ms = sleep.as_millis() as u64, "Rate limited");
            tokio::time::sleep(sleep).await;
        }
    }

    /// Consume a token, or return the time until one is due
    fn take_or_wait(&self) -> Option<Duration> {
        let rate = self.config.rate_per_sec;
        let mut bucket = self.bucket.lock();
        bucket.refill(rate, Instant::now());

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            self.acquired.fetch_add(1, Ordering::Relaxed);
            None
        } else {
            Some(Duration::from_secs_f64((1.0 - bucket.tokens) / rate))
        }
    }

    /// `wait ± jitter`, never below 1ms
    fn jittered(&self, wait: Duration) -> Duration {
        let bound = self.config.jitter_ms as i64;
        let jitter = if bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(-bound..=bound)
        };
        let ms = wait.as_secs_f64() * 1000.0 + jitter as f64;
        Duration::from_secs_f64(ms.max(1.0) / 1000.0)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rate(&self) -> f64 {
        self.config.rate_per_sec
    }

    /// Tokens currently available
    pub fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill(self.config.rate_per_sec, Instant::now());
        bucket.tokens
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::Relaxed)
    }

    /// Calls to `acquire` that had to wait
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}

/// One limiter per named resource (e.g. per provider)
pub struct RateLimiterRegistry {
    default_config: RateLimiterConfig,
    overrides: DashMap<String, RateLimiterConfig>,
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    pub fn new(default_config: RateLimiterConfig) -> Self {
        Self {
            default_config,
            overrides: DashMap::new(),
            limiters: DashMap::new(),
        }
    }

    /// Configure a resource before its limiter is first used
    pub fn configure(&self, name: &str, config: RateLimiterConfig) {
        self.overrides.insert(name.to_string(), config);
    }

    /// Shared limiter for `name`, created on first use
    pub fn get(&self, name: &str) -> Arc<RateLimiter> {
        self.limiters
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(RateLimiter::new(name, config))
            })
            .clone()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_hundred_acquires_at_ten_per_second() {
        let limiter = RateLimiter::new("provider", RateLimiterConfig::default());
        let start = Instant::now();

        for _ in 0..100 {
            limiter.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(9), "elapsed {:?}", elapsed);
        // 90 waits, each at most 100ms of jitter over the token interval
        assert!(elapsed <= Duration::from_secs(18) + Duration::from_millis(100));
        assert_eq!(limiter.acquired(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_capacity_is_immediate() {
        let limiter = RateLimiter::new(
            "burst",
            RateLimiterConfig {
                rate_per_sec: 5.0,
                jitter_ms: 0,
            },
        );

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }
        assert!(!limiter.try_acquire());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let limiter = RateLimiter::new("cap", RateLimiterConfig::default());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.available() <= 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_bucket() {
        let limiter = Arc::new(RateLimiter::new(
            "shared",
            RateLimiterConfig {
                rate_per_sec: 10.0,
                jitter_ms: 0,
            },
        ));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    for _ in 0..10 {
                        limiter.acquire().await;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(limiter.acquired(), 40);
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert!(limiter.throttled() > 0);
    }

    #[test]
    fn test_registry_hands_out_shared_limiters() {
        let registry = RateLimiterRegistry::default();
        registry.configure(
            "isbndb",
            RateLimiterConfig {
                rate_per_sec: 1.0,
                jitter_ms: 0,
            },
        );

        let a = registry.get("isbndb");
        let b = registry.get("isbndb");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.rate(), 1.0);
        assert_eq!(registry.get("google-books").rate(), 10.0);
        assert_eq!(registry.len(), 2);
    }
}
