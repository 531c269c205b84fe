//! tomecache - Tiered Response Cache and Predictive Warming
//!
//! Fronts a book-metadata enrichment API whose upstream providers are slow
//! and rate-limited. Responses are served from a three-tier cache with
//! stale-while-revalidate, negative caching and request coalescing, and
//! popular author queries are warmed ahead of demand.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────┐
//!   request ────▶ │ CacheRouter  │──▶ Edge ─▶ Persistent ─▶ Cold index
//!                 └──────┬───────┘
//!                        │ analytics events
//!                        ▼
//!                 ┌──────────────┐    ┌──────────────────┐
//!                 │ MetricsStore │──▶ │ WarmingAnalyzer  │──▶ queue ──▶ WarmingConsumer
//!                 └──────┬───────┘    └──────────────────┘
//!                        ▼
//!                 ┌──────────────┐
//!                 │ AlertMonitor │
//!                 └──────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tiers, router, coalescer, negative cache, response headers
//! - [`analytics`] - Metrics sink, aggregating store, Prometheus exposition
//! - [`warming`] - Candidate selection, job queue, bounded-parallel consumer
//! - [`alerts`] - Threshold evaluation and deduplicated notification
//! - [`ratelimit`] - Token-bucket limiter with jitter
//! - [`provider`] - Provider-fetch seam and HTTP adapter
//! - [`jobs`] - Periodic job runner
//! - [`config`] - YAML engine configuration
//! - [`clock`] - Time source seam
//! - [`error`] - Error types

pub mod alerts;
pub mod analytics;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod jobs;
pub mod provider;
pub mod ratelimit;
pub mod warming;

// Re-export commonly used types
pub use cache::{CacheHeaders, CacheKey, CacheLookup, CacheRouter, CacheTiers, Category, Resolved};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use provider::{HttpProvider, Provider};
pub use ratelimit::RateLimiter;
pub use warming::{WarmingAnalyzer, WarmingConsumer};
pub use alerts::AlertMonitor;
