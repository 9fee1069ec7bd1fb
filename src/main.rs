//! tiercache load generator
//!
//! Builds a tiered cache from CLI flags (optionally layered over a YAML
//! configuration file), drives it with concurrent workers for a fixed
//! duration and prints the final statistics as JSON.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        tiercache (bin)                          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Workers    │───▶│ CacheManager │───▶│   Exporter   │       │
//! │  │ get/set mix  │    │ fast/remote  │    │  /metrics    │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! │          ▲                  ▲                                   │
//! │  ┌──────────────┐           │                                   │
//! │  │ Invalidator  │───────────┘ delete_by_tags                    │
//! │  └──────────────┘                                               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::config::{load_yaml, parse_duration};
use tiercache::tier::TieredStats;
use tiercache::{
    CacheBackend, CacheExporter, CacheManager, EvictionPolicy, InMemoryBackend, TieredConfig,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - load generator for the tiered cache engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML file with a tiered cache configuration; flags override it
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Number of shards in the fast tier
    #[arg(long, env = "TIERCACHE_SHARDS")]
    shards: Option<usize>,

    /// Maximum live entries in the fast tier
    #[arg(long, env = "TIERCACHE_MAX_ENTRIES")]
    max_entries: Option<usize>,

    /// Default TTL of the fast tier (e.g. "1h", "90s", "0" for none)
    #[arg(long, env = "TIERCACHE_DEFAULT_TTL", value_parser = parse_duration)]
    default_ttl: Option<Duration>,

    /// Interval between expiry sweeps
    #[arg(long, env = "TIERCACHE_SWEEP_INTERVAL", value_parser = parse_duration)]
    sweep_interval: Option<Duration>,

    /// Eviction policy (lru, lfu, unordered)
    #[arg(long, env = "TIERCACHE_EVICTION_POLICY")]
    eviction_policy: Option<EvictionPolicy>,

    /// Attach an in-memory remote tier
    #[arg(long, env = "TIERCACHE_REMOTE")]
    remote: bool,

    /// Simulated round-trip latency of the remote tier
    #[arg(long, env = "TIERCACHE_REMOTE_LATENCY", default_value = "1ms", value_parser = parse_duration)]
    remote_latency: Duration,

    /// Number of concurrent workers
    #[arg(long, env = "TIERCACHE_WORKERS", default_value = "16")]
    workers: usize,

    /// How long to run the workload
    #[arg(long, env = "TIERCACHE_DURATION", default_value = "10s", value_parser = parse_duration)]
    duration: Duration,

    /// Number of distinct keys the workers draw from
    #[arg(long, env = "TIERCACHE_KEYSPACE", default_value = "50000")]
    keyspace: u64,

    /// Size of each cached value in bytes
    #[arg(long, env = "TIERCACHE_VALUE_SIZE", default_value = "256")]
    value_size: usize,

    /// Fraction of operations that are writes (0.0 - 1.0)
    #[arg(long, env = "TIERCACHE_WRITE_RATIO", default_value = "0.2")]
    write_ratio: f64,

    /// Number of tag groups keys are spread across
    #[arg(long, env = "TIERCACHE_TAG_GROUPS", default_value = "16")]
    tag_groups: u64,

    /// Interval between tag-group invalidations ("0" disables them)
    #[arg(long, env = "TIERCACHE_INVALIDATE_EVERY", default_value = "1s", value_parser = parse_duration)]
    invalidate_every: Duration,

    /// Serve Prometheus metrics and health on this address while running
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn tiered_config(&self) -> anyhow::Result<TieredConfig> {
        let mut config: TieredConfig = match &self.config {
            Some(path) => load_yaml(path)
                .with_context(|| format!("loading configuration from {}", path.display()))?,
            None => TieredConfig::default(),
        };

        if let Some(shards) = self.shards {
            config.store.shard_count = shards;
        }
        if let Some(max_entries) = self.max_entries {
            config.store.max_entries = max_entries;
        }
        if let Some(ttl) = self.default_ttl {
            config.store.default_ttl = ttl;
        }
        if let Some(interval) = self.sweep_interval {
            config.store.sweep_interval = interval;
        }
        if let Some(policy) = self.eviction_policy {
            config.store.eviction_policy = policy;
        }
        config.remote.enabled = config.remote.enabled && self.remote;

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.tiered_config()?;

    info!("Starting tiercache load generator");
    info!("  Workers: {}", args.workers);
    info!("  Duration: {:?}", args.duration);
    info!("  Keyspace: {} keys, {} byte values", args.keyspace, args.value_size);
    info!("  Write ratio: {:.2}", args.write_ratio);
    info!(
        "  Fast tier: {} shards, {} max entries, policy={}",
        config.store.shard_count, config.store.max_entries, config.store.eviction_policy
    );
    info!("  Remote tier: {}", config.remote.enabled);

    let remote: Option<Arc<dyn CacheBackend<Bytes>>> = if config.remote.enabled {
        let backend = InMemoryBackend::new("in-memory-remote")
            .with_default_ttl(config.remote.ttl)
            .with_latency(args.remote_latency);
        Some(Arc::new(backend))
    } else {
        None
    };

    let manager = Arc::new(CacheManager::with_backends(config, None, remote)?);
    manager.start()?;

    let exporter = CacheExporter::new("tiercache")?;
    if let Some(addr) = args.metrics_addr.clone() {
        let manager = Arc::clone(&manager);
        let exporter = exporter.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&addr, manager, exporter).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let shutdown = CancellationToken::new();
    let started_at = Utc::now();
    let started = Instant::now();

    let workload = Workload::from_args(&args);
    let mut workers = JoinSet::new();
    for id in 0..args.workers {
        let manager = Arc::clone(&manager);
        let shutdown = shutdown.clone();
        workers.spawn(run_worker(id as u64, manager, workload.clone(), shutdown));
    }

    let invalidator = (!args.invalidate_every.is_zero()).then(|| {
        tokio::spawn(run_invalidator(
            Arc::clone(&manager),
            args.invalidate_every,
            args.tag_groups,
            shutdown.clone(),
        ))
    });

    tokio::select! {
        _ = tokio::time::sleep(args.duration) => {}
        _ = tokio::signal::ctrl_c() => warn!("Interrupted, stopping workers"),
    }
    shutdown.cancel();

    let mut totals = WorkerReport::default();
    while let Some(result) = workers.join_next().await {
        match result {
            Ok(report) => totals.merge(&report),
            Err(e) => error!("Worker failed: {}", e),
        }
    }
    let invalidations = match invalidator {
        Some(handle) => handle.await.unwrap_or_else(|e| {
            error!("Invalidator failed: {}", e);
            0
        }),
        None => 0,
    };

    manager.settle().await;
    let elapsed = started.elapsed();
    let stats = manager.stats();
    exporter.observe_tiers(&stats);

    let report = RunReport {
        started_at,
        finished_at: Utc::now(),
        elapsed_secs: elapsed.as_secs_f64(),
        ops_per_sec: totals.operations() as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        invalidated: invalidations,
        workload: totals,
        cache: stats,
    };

    manager.close().await?;

    info!(
        "Completed {} operations in {:.2}s ({:.0} ops/s)",
        report.workload.operations(),
        report.elapsed_secs,
        report.ops_per_sec
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

// =============================================================================
// Workload
// =============================================================================

#[derive(Debug, Clone)]
struct Workload {
    keyspace: u64,
    write_ratio: f64,
    tag_groups: u64,
    value: Bytes,
}

impl Workload {
    fn from_args(args: &Args) -> Self {
        Self {
            keyspace: args.keyspace.max(1),
            write_ratio: args.write_ratio.clamp(0.0, 1.0),
            tag_groups: args.tag_groups.max(1),
            value: Bytes::from(vec![0xA5u8; args.value_size]),
        }
    }
}

/// Per-worker operation counts
#[derive(Debug, Default, Clone, Serialize)]
struct WorkerReport {
    reads: u64,
    writes: u64,
    hits: u64,
    misses: u64,
    errors: u64,
}

impl WorkerReport {
    fn merge(&mut self, other: &WorkerReport) {
        self.reads += other.reads;
        self.writes += other.writes;
        self.hits += other.hits;
        self.misses += other.misses;
        self.errors += other.errors;
    }

    fn operations(&self) -> u64 {
        self.reads + self.writes
    }
}

#[derive(Debug, Serialize)]
struct RunReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    elapsed_secs: f64,
    ops_per_sec: f64,
    invalidated: usize,
    workload: WorkerReport,
    cache: TieredStats,
}

/// xorshift64* key generator
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

fn tag_for(key_id: u64, groups: u64) -> String {
    format!("group:{}", key_id % groups)
}

async fn run_worker(
    id: u64,
    manager: Arc<CacheManager<Bytes>>,
    workload: Workload,
    shutdown: CancellationToken,
) -> WorkerReport {
    let mut rng = XorShift::new(id + 1);
    let mut report = WorkerReport::default();

    while !shutdown.is_cancelled() {
        let key_id = rng.next_u64() % workload.keyspace;
        let key = format!("key:{}", key_id);

        if rng.next_f64() < workload.write_ratio {
            let tag = tag_for(key_id, workload.tag_groups);
            report.writes += 1;
            if let Err(e) = manager
                .set_with_tags(&key, workload.value.clone(), &[tag.as_str()])
                .await
            {
                report.errors += 1;
                warn!("Worker {} write failed: {}", id, e);
            }
        } else {
            report.reads += 1;
            match manager.get(&key).await {
                Some(_) => report.hits += 1,
                None => report.misses += 1,
            }
        }

        // Fast-tier operations never yield on their own
        if report.operations() % 256 == 0 {
            tokio::task::yield_now().await;
        }
    }
    report
}

async fn run_invalidator(
    manager: Arc<CacheManager<Bytes>>,
    every: Duration,
    groups: u64,
    shutdown: CancellationToken,
) -> usize {
    let mut rng = XorShift::new(u64::MAX);
    let mut tick = tokio::time::interval(every);
    tick.tick().await;
    let mut invalidated = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick.tick() => {
                let tag = tag_for(rng.next_u64(), groups.max(1));
                match manager.delete_by_tags(&[tag.as_str()]).await {
                    Ok(removed) => {
                        invalidated += removed;
                        info!("Invalidated {} entries tagged {}", removed, tag);
                    }
                    Err(e) => error!("Invalidation of {} failed: {}", tag, e),
                }
            }
        }
    }
    invalidated
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
    for directive in ["hyper=warn", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
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
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    manager: Arc<CacheManager<Bytes>>,
    exporter: CacheExporter,
) -> anyhow::Result<()> {
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(body.into()));
        *response.status_mut() = status;
        if let Ok(value) = content_type.parse() {
            response
                .headers_mut()
                .insert(hyper::header::CONTENT_TYPE, value);
        }
        response
    }

    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics server address: {}", addr))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server to {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("metrics server accept error")?;

        let io = TokioIo::new(stream);
        let manager = Arc::clone(&manager);
        let exporter = exporter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let manager = Arc::clone(&manager);
                let exporter = exporter.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            exporter.observe_tiers(&manager.stats());
                            match exporter.render() {
                                Ok(text) => respond(StatusCode::OK, exporter.content_type(), text),
                                Err(e) => respond(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    "text/plain",
                                    e.to_string(),
                                ),
                            }
                        }
                        "/healthz" | "/livez" | "/readyz" => {
                            respond(StatusCode::OK, "text/plain", "ok")
                        }
                        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}
