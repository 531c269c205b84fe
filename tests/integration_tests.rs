//! tomecache Integration Tests
//!
//! End-to-end flows through the public API:
//! - Tiered lookup, stale-while-revalidate, negative caching, coalescing
//! - Cold rehydration
//! - Analytics-driven warming
//! - Alerting
//! - Rate limiting

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tomecache::analytics::{sources, InMemoryMetricsStore, MetricsStore, NullSink};
use tomecache::cache::{
    CacheEntry, CacheKey, CacheLookup, CacheRouter, CacheSource, CacheTiers, EdgeConfig,
    EdgeWindows, RouterConfig, TtlPolicy,
};
use tomecache::clock::{Clock, ManualClock};
use tomecache::provider::{InMemoryProvider, Provider};

const DAY: u64 = 24 * 60 * 60;

fn router_with(
    clock: Arc<ManualClock>,
    windows: EdgeWindows,
    provider: Arc<InMemoryProvider>,
    store: Arc<InMemoryMetricsStore>,
) -> CacheRouter {
    let tiers = CacheTiers::in_memory(
        TtlPolicy::default(),
        EdgeConfig {
            windows,
            ..Default::default()
        },
        clock,
    );
    CacheRouter::new(
        RouterConfig::default(),
        tiers,
        store,
        Some(provider as Arc<dyn Provider>),
    )
}

// =============================================================================
// Tiered Cache
// =============================================================================

mod cache_tests {
    use super::*;
    use assert_matches::assert_matches;
    use tomecache::cache::{CacheHeaders, EdgeTier, Freshness, Rehydration, Resolved};
    use tomecache::Error;

    struct Fixture {
        clock: Arc<ManualClock>,
        provider: Arc<InMemoryProvider>,
        router: CacheRouter,
    }

    fn fixture(windows: EdgeWindows, provider: InMemoryProvider) -> Fixture {
        let clock = ManualClock::starting_now();
        let provider = Arc::new(provider);
        let store = Arc::new(InMemoryMetricsStore::new(clock.clone()));
        let router = router_with(clock.clone(), windows, provider.clone(), store);
        Fixture {
            clock,
            provider,
            router,
        }
    }

    #[tokio::test]
    async fn test_round_trip_every_category() {
        let fx = fixture(EdgeWindows::default(), InMemoryProvider::new());
        let keys = [
            CacheKey::title("The Left Hand of Darkness"),
            CacheKey::isbn("978-0-441-47812-5"),
            CacheKey::author("Ursula K. Le Guin", 0, 100, "publicationYear"),
            CacheKey::parse("enrichment:9780441478125").unwrap(),
            CacheKey::parse("cover:9780441478125").unwrap(),
        ];

        for (i, key) in keys.iter().enumerate() {
            let payload = json!({ "n": i });
            fx.router.set(key, payload.clone(), None).await;
            let lookup = fx.router.get(key).await;
            assert_eq!(lookup.hit().map(|h| h.payload.clone()), Some(payload));
        }
    }

    #[tokio::test]
    async fn test_isbn_scenario() {
        let fx = fixture(EdgeWindows::default(), InMemoryProvider::new());
        let key = CacheKey::parse("isbn:9780451524935").unwrap();

        fx.router
            .set(&key, json!({ "title": "1984", "quality": 0.95 }), None)
            .await;

        let stored = fx
            .router
            .persistent()
            .get(&key.render())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.ttl(), Duration::from_secs(730 * DAY));
        assert_eq!(stored.quality_score, 0.95);

        let hit = fx.router.get(&key).await.hit().cloned().unwrap();
        assert!(matches!(
            hit.source,
            CacheSource::Persistent | CacheSource::EdgeFresh
        ));
        assert!(!hit.is_stale);
    }

    #[tokio::test]
    async fn test_edge_ttl_windows() {
        let clock = ManualClock::starting_now();
        let edge = EdgeTier::new(
            EdgeConfig {
                windows: EdgeWindows::new(1, 10),
                ..Default::default()
            },
            clock.clone(),
        );
        let key = CacheKey::title("solaris");
        edge.put(CacheEntry::positive(
            &key,
            json!({}),
            0.5,
            Duration::from_secs(7 * DAY),
            clock.now(),
        ));

        assert_eq!(edge.get(&key.render()).unwrap().freshness, Freshness::Fresh);

        clock.advance(Duration::from_secs(2));
        assert_eq!(edge.get(&key.render()).unwrap().freshness, Freshness::Stale);

        clock.advance(Duration::from_secs(10));
        assert!(edge.get(&key.render()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_read_does_not_wait_for_refresh() {
        let provider = InMemoryProvider::new().with_latency(Duration::from_secs(2));
        let fx = fixture(EdgeWindows::new(1, 3600), provider);
        let key = CacheKey::title("neuromancer");
        fx.provider.insert(&key, json!({ "edition": 1 }));
        fx.router.get_or_fetch(&key).await.unwrap();

        fx.provider.insert(&key, json!({ "edition": 2 }));
        fx.clock.advance(Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        let stale = fx.router.get(&key).await;
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_matches!(
            &stale,
            CacheLookup::Hit(hit) if hit.is_stale && hit.payload == json!({ "edition": 1 })
        );
        assert_eq!(
            CacheHeaders::for_lookup(&stale, EdgeWindows::new(1, 3600)).x_cache,
            "STALE"
        );

        fx.router.flush_background().await;

        let fresh = fx.router.get(&key).await.hit().cloned().unwrap();
        assert_eq!(fresh.source, CacheSource::EdgeFresh);
        assert_eq!(fresh.payload, json!({ "edition": 2 }));
        assert_eq!(fx.provider.calls_for(&key), 2);
    }

    #[tokio::test]
    async fn test_negative_entry_is_replaced_by_positive_set() {
        let fx = fixture(EdgeWindows::default(), InMemoryProvider::new());
        let key = CacheKey::title("zzzz no such book");

        assert_eq!(
            fx.router.get_or_fetch(&key).await.unwrap(),
            Resolved::FetchedEmpty
        );
        assert_matches!(fx.router.get(&key).await, CacheLookup::Empty { .. });

        fx.router.set(&key, json!({ "title": "Found It" }), None).await;
        let hit = fx.router.get(&key).await.hit().cloned().unwrap();
        assert_eq!(hit.payload, json!({ "title": "Found It" }));
    }

    #[tokio::test]
    async fn test_negative_entry_expires_after_short_ttl() {
        let fx = fixture(EdgeWindows::default(), InMemoryProvider::new());
        let key = CacheKey::title("not yet published");

        fx.router.set_negative(&key).await;
        assert_matches!(fx.router.get(&key).await, CacheLookup::Empty { .. });

        fx.clock.advance(Duration::from_secs(301));
        assert!(fx.router.get(&key).await.is_miss());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let provider = InMemoryProvider::new().with_latency(Duration::from_millis(500));
        let fx = fixture(EdgeWindows::default(), provider);
        let key = CacheKey::title("a wizard of earthsea");
        fx.provider
            .insert(&key, json!({ "items": [{ "title": "A Wizard of Earthsea" }] }));

        let lookups = (0..25).map(|_| fx.router.get_or_fetch(&key));
        let results = futures::future::join_all(lookups).await;

        assert_eq!(fx.provider.calls_for(&key), 1);
        for result in results {
            let resolved = tokio_test::assert_ok!(result);
            assert_eq!(
                resolved.payload(),
                Some(&json!({ "items": [{ "title": "A Wizard of Earthsea" }] }))
            );
        }
        assert_eq!(fx.router.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_reaches_every_waiter() {
        let provider = InMemoryProvider::new().with_latency(Duration::from_millis(500));
        let fx = fixture(EdgeWindows::default(), provider);
        let key = CacheKey::isbn("0000000000");
        fx.provider.fail(&key);

        let results =
            futures::future::join_all((0..5).map(|_| fx.router.get_or_fetch(&key))).await;

        assert_eq!(fx.provider.calls_for(&key), 1);
        for result in results {
            assert_matches!(result, Err(Error::ProviderFailure { .. }));
        }

        // Failures are not cached
        fx.provider.recover(&key);
        fx.provider.insert(&key, json!({ "title": "Recovered" }));
        tokio_test::assert_ok!(fx.router.get_or_fetch(&key).await);
    }

    #[tokio::test]
    async fn test_quality_adjusted_ttls() {
        let fx = fixture(EdgeWindows::default(), InMemoryProvider::new());
        let policy = TtlPolicy::default();

        let rich = json!({
            "isbn": "9780441478125",
            "coverUrl": "https://covers.example.com/lhod.jpg",
            "description": "A lone human ambassador is sent to Winter, an alien world without gender."
        });
        let thin = json!({ "title": "Untitled" });

        let rich_key = CacheKey::isbn("9780441478125");
        let thin_key = CacheKey::title("untitled");
        fx.router.set(&rich_key, rich, None).await;
        fx.router.set(&thin_key, thin, None).await;

        let persistent = fx.router.persistent();
        let rich_entry = persistent.get(&rich_key.render()).await.unwrap().unwrap();
        let thin_entry = persistent.get(&thin_key.render()).await.unwrap().unwrap();

        assert_eq!(rich_entry.ttl(), policy.base_ttl(rich_key.category()) * 2);
        assert_eq!(thin_entry.ttl(), policy.base_ttl(thin_key.category()) / 2);
    }

    #[tokio::test]
    async fn test_cold_hit_rehydrates_once() {
        let fx = fixture(EdgeWindows::default(), InMemoryProvider::new());
        let key = CacheKey::title("the lathe of heaven");
        let archived = CacheEntry::positive(
            &key,
            json!({ "title": "The Lathe of Heaven" }),
            0.7,
            Duration::from_secs(DAY),
            fx.clock.now(),
        );
        fx.router.cold().archive(&archived).await.unwrap();

        let lookup = fx.router.get(&key).await;
        assert_eq!(lookup, CacheLookup::Miss { cold: true });
        assert_eq!(
            CacheHeaders::for_lookup(&lookup, EdgeWindows::default()).x_cache_source,
            "COLD"
        );

        // A second miss while the first rehydration is pending is deduplicated
        assert_eq!(fx.router.get(&key).await, CacheLookup::Miss { cold: true });
        fx.router.flush_background().await;

        let cold = fx.router.cold();
        assert_eq!(cold.promotions(), 1);

        // Once promoted, later attempts find nothing to do
        assert_matches!(
            cold.rehydrate(&key.render()).await,
            Ok(Rehydration::NotArchived)
        );
        assert_eq!(cold.promotions(), 1);
        assert!(cold.lookup(&key.render()).await.unwrap().is_none());

        let stored = fx
            .router
            .persistent()
            .get(&key.render())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.ttl(), Duration::from_secs(7 * DAY));
        assert_eq!(
            fx.router.get(&key).await.hit().map(|h| h.payload.clone()),
            Some(json!({ "title": "The Lathe of Heaven" }))
        );
    }
}

// =============================================================================
// Warming
// =============================================================================

mod warming_tests {
    use super::*;
    use tomecache::analytics::QueryCount;
    use tomecache::ratelimit::{RateLimiter, RateLimiterConfig};
    use tomecache::warming::{
        select_candidates, AnalyzerConfig, ConsumerConfig, InMemoryWarmingQueue, JobOutcome,
        WarmingAnalyzer, WarmingConsumer, WarmingQueue,
    };

    #[test]
    fn test_stephen_king_scenario() {
        let counts = vec![
            QueryCount::new("author", "Stephen King", 47),
            QueryCount::new("author", "Unknown", 3),
        ];
        let config = AnalyzerConfig {
            min_requests: 5,
            ..Default::default()
        };

        let candidates = select_candidates(&counts, &config);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].query, "Stephen King");
        assert_eq!(candidates[0].priority, 47);
    }

    #[tokio::test(start_paused = true)]
    async fn test_misses_drive_warming_end_to_end() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryMetricsStore::new(clock.clone()));
        let provider = Arc::new(InMemoryProvider::new());
        let router = router_with(
            clock.clone(),
            EdgeWindows::default(),
            provider.clone(),
            store.clone(),
        );

        let author = CacheKey::author("Stephen King", 0, 100, "publicationYear");
        provider.insert(
            &author,
            json!({ "works": [{ "title": "The Shining" }, { "title": "Carrie" }] }),
        );
        provider.insert(&CacheKey::title("the shining"), json!({ "items": [{ "title": "The Shining" }] }));
        provider.insert(&CacheKey::title("carrie"), json!({ "items": [{ "title": "Carrie" }] }));

        // Popular but uncached
        for _ in 0..6 {
            assert!(router.get(&author).await.is_miss());
        }
        router.get(&CacheKey::author("Rare Author", 0, 100, "publicationYear")).await;

        let queue = Arc::new(InMemoryWarmingQueue::default());
        let analyzer = WarmingAnalyzer::new(AnalyzerConfig::default(), store.clone(), queue.clone());
        assert_eq!(analyzer.run(clock.now()).await.unwrap(), 1);

        let consumer = WarmingConsumer::new(
            ConsumerConfig::default(),
            router.clone(),
            provider.clone(),
            Arc::new(RateLimiter::new("provider", RateLimiterConfig::default())),
            queue.clone(),
        );
        let outcomes = consumer.run_once().await.unwrap();
        assert_eq!(outcomes, vec![JobOutcome::Warmed { titles: 2 }]);

        assert!(router.get(&author).await.hit().is_some());
        assert!(router.get(&CacheKey::title("The Shining")).await.hit().is_some());
        assert!(router.get(&CacheKey::title("Carrie")).await.hit().is_some());

        // The next day's run re-selects the author but the marker prevents a refetch
        let calls = provider.total_calls();
        queue.send_batch(&[analyzer.analyze(clock.now()).await.unwrap()[0].to_job()])
            .await
            .unwrap();
        assert_eq!(
            consumer.run_once().await.unwrap(),
            vec![JobOutcome::AlreadyWarmed]
        );
        assert_eq!(provider.total_calls(), calls);
    }

    #[tokio::test]
    async fn test_request_counts_group_by_query() {
        let clock = ManualClock::starting_now();
        let store = InMemoryMetricsStore::new(clock.clone());
        store.record_lookups("author", "stephen king", sources::MISS, 4, 900.0);
        store.record_lookups("author", "stephen king", sources::EDGE_FRESH, 3, 1.0);

        let counts = store
            .request_counts(clock.now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(counts, vec![QueryCount::new("author", "stephen king", 7)]);
    }
}

// =============================================================================
// Alerting
// =============================================================================

mod alert_tests {
    use super::*;
    use assert_matches::assert_matches;
    use tomecache::alerts::{
        AlertConfig, AlertMonitor, AlertOutcome, AlertSeverity, AlertType, RecordingNotifier,
    };

    #[tokio::test]
    async fn test_router_traffic_raises_deduplicated_alert() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryMetricsStore::new(clock.clone()));
        let provider = Arc::new(InMemoryProvider::new());
        let router = router_with(
            clock.clone(),
            EdgeWindows::default(),
            provider,
            store.clone(),
        );

        // 3 hits, 2 misses
        let cached = CacheKey::title("dune");
        router.set(&cached, json!({ "title": "Dune" }), None).await;
        for _ in 0..3 {
            router.get(&cached).await;
        }
        router.get(&CacheKey::title("unknown one")).await;
        router.get(&CacheKey::title("unknown two")).await;

        let notifier = Arc::new(RecordingNotifier::new());
        let monitor = AlertMonitor::new(
            AlertConfig::default(),
            store.clone(),
            router.persistent().clone(),
            notifier.clone(),
            Arc::new(NullSink),
        );

        let outcome = monitor.run(clock.now()).await.unwrap();
        assert_matches!(outcome, AlertOutcome::Sent(alert) if alert.severity == AlertSeverity::Critical);

        clock.advance(Duration::from_secs(15 * 60));
        router.get(&CacheKey::title("unknown three")).await;
        assert_matches!(
            monitor.run(clock.now()).await.unwrap(),
            AlertOutcome::Suppressed { .. }
        );
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_raises_p99_alert() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(InMemoryMetricsStore::new(clock.clone()));
        let provider = Arc::new(InMemoryProvider::new().with_latency(Duration::from_millis(800)));
        let router = router_with(
            clock.clone(),
            EdgeWindows::default(),
            provider.clone(),
            store.clone(),
        );

        for i in 0..20 {
            let key = CacheKey::title(&format!("slow title {}", i));
            provider.insert(&key, json!({ "title": format!("Slow Title {}", i) }));
            tokio_test::assert_ok!(router.get_or_fetch(&key).await);
        }

        let summary = store
            .cache_summary(clock.now() - chrono::Duration::minutes(15))
            .await
            .unwrap();
        assert_eq!(summary.total_requests, 20);
        assert!(summary.p99_latency_ms >= 800.0);

        let monitor = AlertMonitor::new(
            AlertConfig::default(),
            store.clone(),
            router.persistent().clone(),
            Arc::new(RecordingNotifier::new()),
            Arc::new(NullSink),
        );
        assert_matches!(
            monitor.run(clock.now()).await.unwrap(),
            AlertOutcome::Sent(alert)
                if alert.severity == AlertSeverity::Critical
                    && alert.types.contains(&AlertType::HighP99Latency)
        );
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

mod ratelimit_tests {
    use super::*;
    use tomecache::ratelimit::{RateLimiter, RateLimiterConfig};

    #[tokio::test(start_paused = true)]
    async fn test_hundred_acquires_take_at_least_nine_seconds() {
        let limiter = RateLimiter::new("provider", RateLimiterConfig::default());
        let start = tokio::time::Instant::now();

        for _ in 0..100 {
            limiter.acquire().await;
        }

        assert!(start.elapsed() >= Duration::from_secs(9));
    }
}
