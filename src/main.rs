//! tomecache daemon
//!
//! Runs the background side of the cache: the daily warming analyzer, the
//! warming consumer, the 15-minute alert monitor, and the health and
//! Prometheus endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           tomecache                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Warming    │───▶│   Warming    │───▶│ CacheRouter  │       │
//! │  │   Analyzer   │    │   Consumer   │    │              │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │  ┌──────────────┐    ┌──────────────┐                           │
//! │  │    Alert     │    │  /metrics    │                           │
//! │  │   Monitor    │    │  /healthz    │                           │
//! │  └──────────────┘    └──────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tomecache::alerts::{AlertMonitor, AlertNotifier, LoggingNotifier, WebhookNotifier};
use tomecache::analytics::{
    FanoutSink, InMemoryMetricsStore, PrometheusSink, SharedSink, TracingSink,
};
use tomecache::cache::{CacheRouter, CacheTiers, InMemoryKvStore, InMemoryObjectStore};
use tomecache::clock::{system_clock, Clock};
use tomecache::jobs::run_periodic;
use tomecache::provider::{HttpProvider, Provider};
use tomecache::ratelimit::RateLimiterRegistry;
use tomecache::warming::{InMemoryWarmingQueue, WarmingAnalyzer, WarmingConsumer};
use tomecache::EngineConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// tomecache - tiered response cache and predictive warming
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TOMECACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Enrichment API base URL (overrides the config file)
    #[arg(long, env = "PROVIDER_URL")]
    provider_url: Option<String>,

    /// Provider calls per second for warming (overrides the config file)
    #[arg(long, env = "PROVIDER_RPS")]
    provider_rps: Option<f64>,

    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Do not run the warming analyzer and consumer
    #[arg(long, env = "DISABLE_WARMING")]
    disable_warming: bool,

    /// Do not run the alert monitor
    #[arg(long, env = "DISABLE_ALERTS")]
    disable_alerts: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(url) = &args.provider_url {
        config.provider.base_url = url.clone();
    }
    if let Some(rps) = args.provider_rps {
        config.rate_limit.rate_per_sec = rps;
    }
    config.validate().context("invalid configuration")?;

    info!("Starting tomecache");
    info!("  Provider URL: {}", config.provider.base_url);
    info!("  Provider rate: {}/s", config.rate_limit.rate_per_sec);
    info!("  Warming: {}", !args.disable_warming);
    info!("  Alerts: {}", !args.disable_alerts);

    // Analytics
    let clock = system_clock();
    let store = Arc::new(InMemoryMetricsStore::new(clock.clone()));
    let prometheus = Arc::new(PrometheusSink::new().context("registering metrics")?);
    let sink: SharedSink = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(prometheus.clone())
            .with(store.clone()),
    );

    // Cache
    let provider: Arc<dyn Provider> =
        Arc::new(HttpProvider::new(config.provider.clone()).context("creating provider")?);
    let tiers = CacheTiers::new(
        config.ttl.clone(),
        config.edge.clone(),
        config.cold.clone(),
        Arc::new(InMemoryKvStore::new(clock.clone())),
        Arc::new(InMemoryObjectStore::new()),
        clock.clone(),
    );
    let router = CacheRouter::new(
        config.router.clone(),
        tiers,
        sink.clone(),
        Some(provider.clone()),
    );

    let shutdown = CancellationToken::new();
    let tasks = TaskTracker::new();
    let queue = Arc::new(InMemoryWarmingQueue::new(config.queue.clone()));

    // Warming
    if !args.disable_warming {
        let limiters = RateLimiterRegistry::new(config.rate_limit.clone());
        let consumer = WarmingConsumer::new(
            config.consumer.clone(),
            router.clone(),
            provider.clone(),
            limiters.get("provider"),
            queue.clone(),
        );
        let token = shutdown.clone();
        tasks.spawn(async move { consumer.run(token).await });

        let analyzer = Arc::new(WarmingAnalyzer::new(
            config.analyzer.clone(),
            store.clone(),
            queue.clone(),
        ));
        let (token, clock) = (shutdown.clone(), clock.clone());
        let period = config.schedule.analyzer_interval();
        tasks.spawn(async move {
            run_periodic("warming-analyzer", period, token, || {
                let analyzer = analyzer.clone();
                let now = clock.now();
                async move { analyzer.run(now).await }
            })
            .await
        });
        info!("Warming pipeline started");
    }

    // Alerts
    if !args.disable_alerts {
        let notifier: Arc<dyn AlertNotifier> = match &config.alerts.webhook_url {
            Some(url) => Arc::new(
                WebhookNotifier::new(url.clone(), Duration::from_secs(10))
                    .context("creating alert webhook")?,
            ),
            None => Arc::new(LoggingNotifier),
        };
        let monitor = Arc::new(AlertMonitor::new(
            config.alerts.clone(),
            store.clone(),
            router.persistent().clone(),
            notifier,
            sink.clone(),
        ));
        let (token, clock) = (shutdown.clone(), clock.clone());
        let period = config.schedule.alert_interval();
        tasks.spawn(async move {
            run_periodic("alert-monitor", period, token, || {
                let monitor = monitor.clone();
                let now = clock.now();
                async move { monitor.run(now).await }
            })
            .await
        });
        info!("Alert monitor started");
    }

    // Event retention: keep the longest window any job reads
    {
        let retention = config
            .analyzer
            .lookback()
            .max(config.alerts.window())
            .max(Duration::from_secs(60));
        let retention = chrono::Duration::from_std(retention).context("event retention")?;
        let (token, clock, store) = (shutdown.clone(), clock.clone(), store.clone());
        tasks.spawn(async move {
            run_periodic("event-retention", Duration::from_secs(3600), token, || {
                let pruned = store.prune(clock.now() - retention);
                async move { Ok::<_, tomecache::Error>(pruned) }
            })
            .await
        });
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let exporter = prometheus.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");

    shutdown.cancel();
    queue.close();
    tasks.close();
    tasks.wait().await;
    router.flush_background().await;

    let metrics = router.metrics();
    info!(
        hit_ratio = metrics.overall_hit_ratio,
        provider_fetches = metrics.provider_fetches,
        "tomecache shutdown complete"
    );
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// HTTP Endpoints
// =============================================================================

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn health_handler(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn metrics_response(req: &Request<Incoming>, exporter: &PrometheusSink) -> Response<Full<Bytes>> {
    if req.uri().path() != "/metrics" {
        return text_response(StatusCode::NOT_FOUND, "not found");
    }

    match exporter.render() {
        Ok((content_type, body)) => {
            let mut response = text_response(StatusCode::OK, body);
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "metrics unavailable")
        }
    }
}

async fn bind(addr: &str, name: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {} server address", name))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} server", name))?;
    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

async fn run_health_server(addr: &str) -> anyhow::Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener.accept().await.context("health server accept")?;
        let io = TokioIo::new(stream);

        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(io, service_fn(health_handler))
                .await
            {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(addr: &str, exporter: Arc<PrometheusSink>) -> anyhow::Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener.accept().await.context("metrics server accept")?;
        let io = TokioIo::new(stream);
        let exporter = exporter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| {
                let response = metrics_response(&req, &exporter);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
