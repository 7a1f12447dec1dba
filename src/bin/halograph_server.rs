//! Halograph Server - TCP feature server for GNN training workers
//!
//! Loads a static graph dataset, splits it across training workers, pre-warms
//! one budgeted feature cache per worker, then serves sampling and feature
//! requests until shutdown.
//!
//! Usage:
//!   halograph-server /path/to/dataset --workers 4 [--listen 127.0.0.1:7741]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]
//!
//! Each client binds a worker index with GetPartition, then issues Sample and
//! GetFeatures against that worker's cache. Requests carry an optional `seq`
//! tag that is echoed back; responses within a session are written strictly
//! in request order.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{bounded, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use halograph::cache::FeatureCache;
use halograph::error::GraphError;
use halograph::metrics::{Metrics, Operation, SLOW_REQUEST_THRESHOLD_MS};
use halograph::partition::PartitionManager;
use halograph::resource::{ResourceManager, SystemResources, DEFAULT_WARM_FRACTION};
use halograph::sample::{resolve_features, Provenance, SampleRequest, SamplingEngine};
use halograph::session::ClientSession;
use halograph::store::{dataset, GraphStore};

// Global client ID counter
static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

/// Maximum accepted frame payload size.
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const PROTOCOL_VERSION: u32 = 1;

// ============================================================================
// Wire Protocol Types
// ============================================================================

/// Request from client
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    /// Negotiate protocol version with server
    Hello {
        #[serde(rename = "protocolVersion")]
        protocol_version: Option<u32>,
        #[serde(rename = "clientId")]
        client_id: Option<String>,
    },

    /// Bind this session to a worker and fetch its partition + halo
    GetPartition {
        #[serde(rename = "workerIndex")]
        worker_index: usize,
    },

    /// Sample a minibatch neighborhood with features resolved
    Sample {
        #[serde(rename = "seedNodeIds")]
        seed_node_ids: Vec<u64>,
        fanout: usize,
        #[serde(rename = "numHops")]
        num_hops: usize,
        #[serde(default, rename = "randomSeed")]
        random_seed: Option<u64>,
    },

    /// Fetch feature rows for explicit node ids
    GetFeatures {
        #[serde(rename = "nodeIds")]
        node_ids: Vec<u64>,
    },

    /// Server and cache statistics
    GetStats,

    Ping,

    Shutdown,
}

/// Response to client
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    HelloOk {
        ok: bool,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
        #[serde(rename = "serverVersion")]
        server_version: String,
    },

    PartitionInfo {
        #[serde(rename = "workerIndex")]
        worker_index: usize,
        nodes: Vec<u64>,
        halo: Vec<u64>,
    },

    Subgraph {
        nodes: Vec<u64>,
        edges: Vec<(u64, u64)>,
        features: Vec<Vec<f32>>,
        provenance: Vec<Provenance>,
        seed: u64,
    },

    Features {
        features: Vec<Vec<f32>>,
        provenance: Vec<Provenance>,
    },

    /// Statistics response
    Stats {
        #[serde(rename = "nodeCount")]
        node_count: u64,
        #[serde(rename = "edgeCount")]
        edge_count: u64,
        #[serde(rename = "featureDim")]
        feature_dim: u64,
        #[serde(rename = "numWorkers")]
        num_workers: u64,

        #[serde(rename = "memoryPercent")]
        memory_percent: f32,

        #[serde(rename = "requestCount")]
        request_count: u64,
        #[serde(rename = "errorCount")]
        error_count: u64,
        #[serde(rename = "slowRequestCount")]
        slow_request_count: u64,
        #[serde(rename = "rejectedBusy")]
        rejected_busy: u64,
        #[serde(rename = "timedOut")]
        timed_out: u64,
        #[serde(rename = "sampleCount")]
        sample_count: u64,
        #[serde(rename = "sampledNodes")]
        sampled_nodes: u64,
        #[serde(rename = "latencyP50Ms")]
        latency_p50_ms: u64,
        #[serde(rename = "latencyP95Ms")]
        latency_p95_ms: u64,
        #[serde(rename = "latencyP99Ms")]
        latency_p99_ms: u64,

        #[serde(rename = "cacheHits")]
        cache_hits: u64,
        #[serde(rename = "cacheMisses")]
        cache_misses: u64,
        #[serde(rename = "cacheEvictions")]
        cache_evictions: u64,
        #[serde(rename = "cacheEntries")]
        cache_entries: u64,
        #[serde(rename = "cacheUsedBytes")]
        cache_used_bytes: u64,
        #[serde(rename = "cacheBudgetBytes")]
        cache_budget_bytes: u64,

        #[serde(rename = "topSlowRequests")]
        top_slow_requests: Vec<WireSlowRequest>,

        #[serde(rename = "uptimeSecs")]
        uptime_secs: u64,
    },

    Pong { pong: bool, version: String },

    Ok { ok: bool },

    /// Structured error with code (for programmatic handling)
    ErrorWithCode { error: String, code: String },
}

/// Request envelope: captures the client's seq tag alongside the tagged Request.
#[derive(Deserialize)]
struct RequestEnvelope {
    #[serde(default)]
    seq: Option<u64>,
    #[serde(flatten)]
    request: Request,
}

/// Response envelope: every response carries the resolved sequence number.
#[derive(Serialize)]
struct ResponseEnvelope {
    seq: u64,
    #[serde(flatten)]
    response: Response,
}

#[derive(Debug, Serialize)]
pub struct WireSlowRequest {
    pub operation: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: u64,
}

fn error_response(err: &GraphError) -> Response {
    Response::ErrorWithCode {
        error: err.to_string(),
        code: err.code().to_string(),
    }
}

fn operation_of(request: &Request) -> Operation {
    match request {
        Request::GetPartition { .. } => Operation::GetPartition,
        Request::Sample { .. } => Operation::Sample,
        Request::GetFeatures { .. } => Operation::GetFeatures,
        _ => Operation::Other,
    }
}

// ============================================================================
// Server State and Dispatch Pool
// ============================================================================

struct ServerState {
    store: Arc<GraphStore>,
    partitions: PartitionManager,
    caches: Vec<Arc<FeatureCache>>,
    engine: SamplingEngine,
    metrics: Arc<Metrics>,
    halo_hops: usize,
}

/// Work executed on the dispatch pool. Cheap control requests never go
/// through here.
enum JobKind {
    GetPartition { worker: usize },
    Sample { request: SampleRequest, worker: usize },
    GetFeatures { nodes: Vec<u64>, worker: usize },
}

struct Job {
    kind: JobKind,
    reply: Sender<Response>,
}

/// Spawn `pool_size` workers behind a bounded queue of `queue_depth` slots.
fn spawn_pool(state: Arc<ServerState>, pool_size: usize, queue_depth: usize) -> Sender<Job> {
    let (tx, rx) = bounded::<Job>(queue_depth);
    for worker_id in 0..pool_size {
        let state = Arc::clone(&state);
        let rx = rx.clone();
        thread::Builder::new()
            .name(format!("dispatch-{worker_id}"))
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    let response = execute_job(&state, job.kind);
                    // Receiver gone means the client timed out or
                    // disconnected; the result is discarded.
                    let _ = job.reply.send(response);
                }
            })
            .expect("failed to spawn dispatch worker");
    }
    tx
}

fn execute_job(state: &ServerState, kind: JobKind) -> Response {
    match kind {
        JobKind::GetPartition { worker } => {
            let nodes = match state.partitions.members(worker) {
                Ok(members) => members.to_vec(),
                Err(e) => return error_response(&e),
            };
            match state.partitions.compute_halo(worker, state.halo_hops) {
                Ok(halo) => Response::PartitionInfo {
                    worker_index: worker,
                    nodes,
                    halo,
                },
                Err(e) => error_response(&e),
            }
        }
        JobKind::Sample { request, worker } => {
            match state.engine.sample(&request, &state.caches[worker]) {
                Ok(result) => {
                    state.metrics.record_sampled_nodes(result.nodes.len());
                    Response::Subgraph {
                        nodes: result.nodes,
                        edges: result.edges,
                        features: result.features.iter().map(|f| f.to_vec()).collect(),
                        provenance: result.provenance,
                        seed: result.seed,
                    }
                }
                Err(e) => error_response(&e),
            }
        }
        JobKind::GetFeatures { nodes, worker } => {
            for &node in &nodes {
                if let Err(e) = state.store.check_node(node) {
                    return error_response(&e);
                }
            }
            match resolve_features(&state.store, &state.caches[worker], &nodes) {
                Ok((features, provenance)) => Response::Features {
                    features: features.iter().map(|f| f.to_vec()).collect(),
                    provenance,
                },
                Err(e) => error_response(&e),
            }
        }
    }
}

/// Submit a job and wait for the result with backpressure semantics: a
/// full queue rejects immediately, a slow job times out and its late
/// result is discarded.
fn submit_job(
    state: &ServerState,
    jobs: &Sender<Job>,
    kind: JobKind,
    request_timeout: Duration,
) -> Response {
    let (reply_tx, reply_rx) = bounded::<Response>(1);
    match jobs.try_send(Job {
        kind,
        reply: reply_tx,
    }) {
        Ok(()) => match reply_rx.recv_timeout(request_timeout) {
            Ok(response) => response,
            Err(_) => {
                state.metrics.record_timeout();
                error_response(&GraphError::Timeout)
            }
        },
        Err(TrySendError::Full(_)) => {
            state.metrics.record_busy_rejection();
            error_response(&GraphError::ServerBusy)
        }
        Err(TrySendError::Disconnected(_)) => error_response(&GraphError::Configuration(
            "dispatch pool is shut down".into(),
        )),
    }
}

fn build_stats(state: &ServerState) -> Response {
    let snapshot = state.metrics.snapshot();

    let mut hits = 0u64;
    let mut misses = 0u64;
    let mut evictions = 0u64;
    let mut entries = 0u64;
    let mut used = 0u64;
    let mut budget = 0u64;
    for cache in &state.caches {
        let s = cache.stats();
        hits += s.hits;
        misses += s.misses;
        evictions += s.evictions;
        entries += s.entries as u64;
        used += s.used_bytes as u64;
        budget += s.budget_bytes as u64;
    }

    let memory_percent = (SystemResources::detect().memory_pressure() * 100.0) as f32;

    Response::Stats {
        node_count: state.store.num_nodes() as u64,
        edge_count: state.store.num_edges() as u64,
        feature_dim: state.store.feature_dim() as u64,
        num_workers: state.partitions.num_workers() as u64,
        memory_percent,
        request_count: snapshot.request_count,
        error_count: snapshot.error_count,
        slow_request_count: snapshot.slow_count,
        rejected_busy: snapshot.rejected_busy,
        timed_out: snapshot.timed_out,
        sample_count: snapshot.sample_count,
        sampled_nodes: snapshot.sampled_nodes,
        latency_p50_ms: snapshot.latency_p50_ms,
        latency_p95_ms: snapshot.latency_p95_ms,
        latency_p99_ms: snapshot.latency_p99_ms,
        cache_hits: hits,
        cache_misses: misses,
        cache_evictions: evictions,
        cache_entries: entries,
        cache_used_bytes: used,
        cache_budget_bytes: budget,
        top_slow_requests: snapshot
            .top_slow
            .into_iter()
            .map(|s| WireSlowRequest {
                operation: s.operation.to_string(),
                duration_ms: s.duration_ms,
                timestamp_ms: s.timestamp_ms,
            })
            .collect(),
        uptime_secs: snapshot.uptime_secs,
    }
}

// ============================================================================
// Request Handling
// ============================================================================

fn handle_request(
    state: &ServerState,
    session: &mut ClientSession,
    request: Request,
    jobs: &Sender<Job>,
    request_timeout: Duration,
) -> Response {
    match request {
        Request::Hello {
            protocol_version,
            client_id,
        } => {
            info!(
                session = session.id,
                protocol = ?protocol_version,
                client = ?client_id,
                "hello"
            );
            Response::HelloOk {
                ok: true,
                protocol_version: PROTOCOL_VERSION,
                server_version: env!("CARGO_PKG_VERSION").to_string(),
            }
        }

        Request::Ping => Response::Pong {
            pong: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        },

        Request::GetStats => build_stats(state),

        Request::GetPartition { worker_index } => {
            let response = submit_job(
                state,
                jobs,
                JobKind::GetPartition {
                    worker: worker_index,
                },
                request_timeout,
            );
            if matches!(response, Response::PartitionInfo { .. }) {
                session.bind_worker(worker_index);
                info!(session = session.id, worker = worker_index, "worker bound");
            }
            response
        }

        Request::Sample {
            seed_node_ids,
            fanout,
            num_hops,
            random_seed,
        } => match session.worker() {
            Some(worker) => submit_job(
                state,
                jobs,
                JobKind::Sample {
                    request: SampleRequest {
                        seeds: seed_node_ids,
                        fanout,
                        num_hops,
                        seed: random_seed,
                    },
                    worker,
                },
                request_timeout,
            ),
            None => error_response(&GraphError::Configuration(
                "no worker bound; send getPartition first".into(),
            )),
        },

        Request::GetFeatures { node_ids } => match session.worker() {
            Some(worker) => submit_job(
                state,
                jobs,
                JobKind::GetFeatures {
                    nodes: node_ids,
                    worker,
                },
                request_timeout,
            ),
            None => error_response(&GraphError::Configuration(
                "no worker bound; send getPartition first".into(),
            )),
        },

        // Handled by the caller before dispatch
        Request::Shutdown => Response::Ok { ok: true },
    }
}

// ============================================================================
// Framing
// ============================================================================

fn read_message(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    // Read 4-byte length prefix (big-endian)
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    // Read payload
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;

    Ok(Some(buf))
}

fn write_message(stream: &mut TcpStream, data: &[u8]) -> std::io::Result<()> {
    // Write 4-byte length prefix (big-endian)
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

fn is_idle_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

// ============================================================================
// Connection Loop
// ============================================================================

#[derive(Clone)]
struct ConnectionConfig {
    idle_timeout: Duration,
    request_timeout: Duration,
}

fn handle_client(
    mut stream: TcpStream,
    state: Arc<ServerState>,
    jobs: Sender<Job>,
    client_id: usize,
    config: ConnectionConfig,
) {
    info!(session = client_id, "client connected");

    if let Err(e) = stream.set_read_timeout(Some(config.idle_timeout)) {
        warn!(session = client_id, error = %e, "failed to set read timeout");
        return;
    }

    let mut session = ClientSession::new(client_id);

    loop {
        let msg = match read_message(&mut stream) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!(session = client_id, "client disconnected");
                break;
            }
            Err(e) if is_idle_timeout(&e) => {
                info!(session = client_id, "idle timeout, closing session");
                break;
            }
            Err(e) => {
                warn!(session = client_id, error = %e, "read error");
                break;
            }
        };

        let (client_seq, request) = match rmp_serde::from_slice::<RequestEnvelope>(&msg) {
            Ok(env) => (env.seq, env.request),
            Err(e) => {
                let seq = session.resolve_seq(None);
                let envelope = ResponseEnvelope {
                    seq,
                    response: error_response(&GraphError::Configuration(format!(
                        "invalid request: {e}"
                    ))),
                };
                let resp_bytes = rmp_serde::to_vec_named(&envelope).unwrap();
                let _ = write_message(&mut stream, &resp_bytes);
                continue;
            }
        };

        let seq = session.resolve_seq(client_seq);
        let is_shutdown = matches!(request, Request::Shutdown);

        let start = Instant::now();
        let op = operation_of(&request);

        let response = handle_request(&state, &mut session, request, &jobs, config.request_timeout);

        let duration_ms = start.elapsed().as_millis() as u64;
        state.metrics.record_request(op, duration_ms);
        if matches!(response, Response::ErrorWithCode { .. }) {
            state.metrics.record_error();
        }
        if duration_ms >= SLOW_REQUEST_THRESHOLD_MS {
            warn!(
                session = client_id,
                operation = op.name(),
                duration_ms,
                "slow request"
            );
        }

        let envelope = ResponseEnvelope { seq, response };
        let resp_bytes = match rmp_serde::to_vec_named(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(session = client_id, error = %e, "serialize error");
                continue;
            }
        };

        if let Err(e) = write_message(&mut stream, &resp_bytes) {
            warn!(session = client_id, error = %e, "write error");
            break;
        }

        if is_shutdown {
            info!(session = client_id, "shutdown requested");
            std::process::exit(0);
        }
    }

    info!(
        session = client_id,
        requests = session.requests_served(),
        "session closed"
    );
}

// ============================================================================
// Main
// ============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "halograph-server",
    version,
    about = "Partition-aware graph feature server for multi-GPU GNN training"
)]
struct Args {
    /// Dataset directory (meta.json, adjacency.bin, features.bin)
    dataset: PathBuf,

    /// Number of training workers to partition for
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// TCP listen address
    #[arg(long, default_value = "127.0.0.1:7741")]
    listen: String,

    /// Per-worker cache budget; defaults to a fraction of available RAM
    #[arg(long)]
    cache_budget_bytes: Option<usize>,

    /// Fraction of each cache budget filled during pre-warm
    #[arg(long, default_value_t = DEFAULT_WARM_FRACTION)]
    warm_fraction: f64,

    /// Dispatch pool threads; defaults from the CPU count
    #[arg(long)]
    pool_size: Option<usize>,

    /// Pending request slots before ServerBusy rejections
    #[arg(long)]
    queue_depth: Option<usize>,

    /// Idle sessions are closed after this many seconds
    #[arg(long, default_value_t = 300)]
    idle_timeout_secs: u64,

    /// Per-request execution deadline
    #[arg(long, default_value_t = 30_000)]
    request_timeout_ms: u64,

    /// Halo expansion depth around each partition
    #[arg(long, default_value_t = 1)]
    hops: usize,

    /// Extra nodes a partition may hold beyond the even split
    #[arg(long, default_value_t = 0)]
    balance_tolerance: usize,

    /// Load the assignment from this file, or compute and save it there
    #[arg(long)]
    partition_file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting halograph-server");

    // Load
    let store = Arc::new(
        dataset::load(&args.dataset)
            .with_context(|| format!("failed to load dataset from {:?}", args.dataset))?,
    );
    info!(
        nodes = store.num_nodes(),
        edges = store.num_edges(),
        feature_dim = store.feature_dim(),
        "dataset loaded"
    );

    // Partition
    let partitions = match &args.partition_file {
        Some(path) if path.exists() => {
            info!(file = ?path, "loading persisted partition assignment");
            PartitionManager::load(path, Arc::clone(&store), args.workers)
                .context("failed to load partition assignment")?
        }
        other => {
            let manager =
                PartitionManager::partition(Arc::clone(&store), args.workers, args.balance_tolerance)
                    .context("partitioning failed")?;
            if let Some(path) = other {
                manager
                    .save(path)
                    .with_context(|| format!("failed to save partition assignment to {path:?}"))?;
                info!(file = ?path, "partition assignment saved");
            }
            manager
        }
    };
    for worker in 0..args.workers {
        let owned = partitions.members(worker).map(|m| m.len()).unwrap_or(0);
        info!(worker, owned, "partition sizes");
    }
    info!(edge_cut = partitions.edge_cut(), "partitioning complete");

    // Warm
    let profile = ResourceManager::auto_tune(args.workers);
    let budget = args.cache_budget_bytes.unwrap_or(profile.cache_budget_bytes);
    let pool_size = args.pool_size.unwrap_or(profile.pool_size);
    let queue_depth = args.queue_depth.unwrap_or(profile.queue_depth);
    info!(
        budget,
        pool_size,
        queue_depth,
        memory_pressure = profile.memory_pressure,
        "serving profile"
    );

    let mut caches = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let cache = Arc::new(FeatureCache::new(budget));
        let mut candidates = partitions.members(worker)?.to_vec();
        candidates.extend(partitions.compute_halo(worker, args.hops)?);
        let warmed = cache.prewarm(&store, &candidates, args.warm_fraction)?;
        info!(worker, warmed, "cache warmed");
        caches.push(cache);
    }

    let metrics = Arc::new(Metrics::new());
    let state = Arc::new(ServerState {
        engine: SamplingEngine::new(Arc::clone(&store)),
        store,
        partitions,
        caches,
        metrics,
        halo_hops: args.hops,
    });

    let jobs = spawn_pool(Arc::clone(&state), pool_size, queue_depth);

    // Graceful shutdown on SIGINT/SIGTERM
    let mut signals = signal_hook::iterator::Signals::new([
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
    ])
    .context("failed to register signal handlers")?;
    thread::spawn(move || {
        for sig in signals.forever() {
            info!(signal = sig, "signal received, exiting");
            std::process::exit(0);
        }
    });

    // Serve
    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!(listen = %args.listen, "listening");

    let config = ConnectionConfig {
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
        request_timeout: Duration::from_millis(args.request_timeout_ms),
    };

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst);
                let state = Arc::clone(&state);
                let jobs = jobs.clone();
                let config = config.clone();
                thread::spawn(move || {
                    handle_client(stream, state, jobs, client_id, config);
                });
            }
            Err(e) => {
                warn!(error = %e, "accept error");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
