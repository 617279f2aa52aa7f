//! tiergate gateway process
//!
//! Runs the tiered cache engine with its background eviction loop and
//! uploader, and serves health probes, Prometheus metrics and a JSON
//! snapshot of the engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                            tiergate                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ Memory tier  │───▶│  Disk tier   │───▶│ Remote store │       │
//! │  │  (pooled)    │    │ (block files)│    │  (S3 API)    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │        ▲ eviction / downgrade ▲        upload ▲                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiergate::cache::{CompositeSink, MetricsSnapshot};
use tiergate::{
    CacheConfig, CacheEngine, CacheMetrics, EngineSnapshot, InMemoryRemoteStore, PrometheusStats,
    StatisticsSink,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiergate - tiered caching gateway for S3-compatible object stores
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "TIERGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Disk tier directory (overrides the configuration file)
    #[arg(long, env = "TIERGATE_DISK_ROOT")]
    disk_root: Option<PathBuf>,

    /// Memory tier capacity in bytes (overrides the configuration file)
    #[arg(long, env = "TIERGATE_MEMORY_CAPACITY")]
    memory_capacity: Option<u64>,

    /// Disable the disk tier
    #[arg(long, env = "TIERGATE_NO_DISK")]
    no_disk: bool,

    /// Seconds to wait for pending uploads at shutdown
    #[arg(long, env = "TIERGATE_DRAIN_SECONDS", default_value = "30")]
    drain_seconds: u64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = load_config(&args)?;
    info!("Starting tiergate");
    info!(
        "  Memory tier: enabled={} capacity={}",
        config.memory.enabled, config.memory.capacity_bytes
    );
    info!(
        "  Disk tier: enabled={} capacity={} root={}",
        config.disk.enabled,
        config.disk.capacity_bytes,
        config.disk.root.display()
    );
    info!("  Eviction policy: {:?}", config.eviction.item_policy);

    // The S3 client lives outside this crate; standalone runs use the in-memory store
    let remote = InMemoryRemoteStore::new();
    warn!("No remote backend configured, using the in-memory store");

    let metrics = Arc::new(CacheMetrics::new());
    let sinks: Vec<Arc<dyn StatisticsSink>> =
        vec![metrics.clone(), Arc::new(PrometheusStats::new())];
    let stats: Arc<dyn StatisticsSink> = Arc::new(CompositeSink::new(sinks));

    let recover = config.disk.enabled && config.disk.recover_on_start;
    let engine = Arc::new(
        CacheEngine::new(config, Arc::new(remote), stats).context("Failed to build cache engine")?,
    );

    let cancel = CancellationToken::new();
    let background = engine.start_background(cancel.clone());

    if recover {
        let report = engine
            .recover()
            .await
            .context("Disk tier recovery failed")?;
        info!(
            "Recovered {} objects ({} bytes), removed {} leftover files",
            report.files, report.bytes, report.removed
        );
    }

    let ready = Arc::new(AtomicBool::new(true));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let state = Arc::new(ServerState {
        engine: engine.clone(),
        metrics,
    });
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, state).await {
            error!("Metrics server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    ready.store(false, Ordering::SeqCst);

    let drain = Duration::from_secs(args.drain_seconds);
    if tokio::time::timeout(drain, engine.wait_for_uploads())
        .await
        .is_err()
    {
        warn!("Pending uploads not drained after {:?}; they resume after restart", drain);
    }

    cancel.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            error!("Background task failed: {}", e);
        }
    }

    info!("tiergate shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<CacheConfig> {
    let mut config = match &args.config {
        Some(path) => CacheConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => CacheConfig::default(),
    };
    if let Some(root) = &args.disk_root {
        config.disk.root = root.clone();
    }
    if let Some(capacity) = args.memory_capacity {
        config.memory.capacity_bytes = capacity;
    }
    if args.no_disk {
        config.disk.enabled = false;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

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
}

// =============================================================================
// HTTP helpers
// =============================================================================

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

fn not_found() -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, "text/plain", "not found")
}

async fn bind(addr: &str, name: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid {} server address: {}", name, addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} server", name))?;
    info!("{} server listening on {}", name, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> anyhow::Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener.accept().await.context("Health server accept error")?;
        let io = TokioIo::new(stream);
        let ready = ready.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" => {
                            respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "shutting down")
                        }
                        _ => not_found(),
                    };
                    Ok::<_, Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

struct ServerState {
    engine: Arc<CacheEngine>,
    metrics: Arc<CacheMetrics>,
}

#[derive(Serialize)]
struct StatsBody {
    engine: EngineSnapshot,
    metrics: MetricsSnapshot,
}

fn handle_metrics_request(state: &ServerState, path: &str) -> Response<Full<Bytes>> {
    match path {
        "/metrics" => match tiergate::metrics::encode_text() {
            Ok((content_type, body)) => respond(StatusCode::OK, &content_type, body),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        "/stats" => {
            let body = StatsBody {
                engine: state.engine.snapshot(),
                metrics: state.metrics.snapshot(),
            };
            match serde_json::to_vec_pretty(&body) {
                Ok(json) => respond(StatusCode::OK, "application/json", json),
                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
            }
        }
        _ => not_found(),
    }
}

async fn run_metrics_server(addr: &str, state: Arc<ServerState>) -> anyhow::Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener.accept().await.context("Metrics server accept error")?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = handle_metrics_request(&state, req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
