// Warmpool operator CLI
//
// Design Decision: Every subcommand owns a short-lived pool; there is no daemon.
// Design Decision: Results go to stdout as JSON, logs to stderr.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::info;

use warmpool_pool::{PoolConfig, PoolManager, SandboxPolicyConfig};
use warmpool_protocol::ExecutionRequest;
use warmpool_worker::{init_telemetry, SandboxMode, SandboxRules, TelemetryConfig};

#[derive(Parser)]
#[command(name = "warmpool")]
#[command(about = "Warmpool - run actions on a pool of warm worker processes")]
#[command(version)]
pub struct Cli {
    /// Worker executable (defaults to warmpool-worker next to this binary)
    #[arg(long, env = "WARMPOOL_WORKER_PROGRAM")]
    pub worker_program: Option<PathBuf>,

    /// Directory for worker sockets
    #[arg(long, env = "WARMPOOL_SOCKET_DIR")]
    pub socket_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a pool, run one action and print its result
    Submit {
        /// Registered action name (e.g. testing.add_100)
        #[arg(long)]
        action: String,

        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,

        /// Per-attempt deadline in milliseconds
        #[arg(long, default_value = "60000")]
        deadline_ms: u64,

        /// Pool size
        #[arg(long, default_value = "1")]
        workers: usize,

        /// Return canned results instead of running the action
        #[arg(long)]
        test_mode: bool,

        /// Sandbox variant for the workers
        #[arg(long, value_enum, default_value_t = SandboxMode::Unrestricted)]
        sandbox: SandboxMode,
    },

    /// Measure dispatch overhead against a test-mode pool
    Bench {
        /// Total requests
        #[arg(long, default_value = "10000")]
        requests: usize,

        /// Requests in flight at once
        #[arg(long, default_value = "64")]
        concurrency: usize,

        /// Pool size
        #[arg(long, default_value = "4")]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let mut telemetry = TelemetryConfig::from_env("warmpool");
    if telemetry.log_filter.is_none() {
        telemetry.log_filter = Some("warmpool_pool=info,warmpool_worker=warn".to_string());
    }
    init_telemetry(&telemetry);

    let cli = Cli::parse();
    let mut config = PoolConfig::from_env();
    if let Some(program) = cli.worker_program {
        config = config.with_worker_program(program);
    }
    if let Some(dir) = cli.socket_dir {
        config = config.with_socket_dir(dir);
    }

    match cli.command {
        Commands::Submit {
            action,
            args,
            deadline_ms,
            workers,
            test_mode,
            sandbox,
        } => {
            let args: Value = serde_json::from_str(&args).context("--args is not valid JSON")?;
            if !args.is_object() {
                bail!("--args must be a JSON object");
            }
            let sandbox = match sandbox {
                SandboxMode::Unrestricted => SandboxPolicyConfig::unrestricted(),
                SandboxMode::Sandboxed => SandboxPolicyConfig::sandboxed(SandboxRules::default()),
            };
            let config = config.with_test_mode(test_mode).with_sandbox(sandbox);
            let request = ExecutionRequest::new(action)
                .with_args(args)
                .with_deadline(Duration::from_millis(deadline_ms));
            submit(config, workers, request).await
        }
        Commands::Bench {
            requests,
            concurrency,
            workers,
        } => bench(config.with_test_mode(true), workers, requests, concurrency).await,
    }
}

async fn submit(config: PoolConfig, workers: usize, request: ExecutionRequest) -> Result<()> {
    let grace = config.shutdown_grace_period;
    let pool = PoolManager::new(config);
    pool.start(workers).await.context("Failed to start worker pool")?;

    let outcome = pool.submit(request).await;
    pool.shutdown(grace).await.context("Failed to shut down worker pool")?;

    let result = outcome?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn bench(
    config: PoolConfig,
    workers: usize,
    requests: usize,
    concurrency: usize,
) -> Result<()> {
    let grace = config.shutdown_grace_period;
    let pool = PoolManager::new(config);
    pool.start(workers).await.context("Failed to start worker pool")?;
    info!(requests, concurrency, workers, "Running benchmark");

    let started = Instant::now();
    let outcomes: Vec<(Duration, bool)> = stream::iter(0..requests)
        .map(|i| {
            let pool = pool.clone();
            async move {
                let request = ExecutionRequest::new("testing.echo").with_arg("i", i);
                let sent = Instant::now();
                let ok = matches!(pool.submit(request).await, Ok(result) if result.is_success());
                (sent.elapsed(), ok)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    let elapsed = started.elapsed();

    pool.shutdown(grace).await.context("Failed to shut down worker pool")?;

    let failed = outcomes.iter().filter(|(_, ok)| !ok).count();
    let mut latencies: Vec<Duration> = outcomes.into_iter().map(|(d, _)| d).collect();
    latencies.sort_unstable();

    let report = serde_json::json!({
        "requests": requests,
        "failed": failed,
        "workers": workers,
        "concurrency": concurrency,
        "elapsed_ms": elapsed.as_secs_f64() * 1000.0,
        "throughput_per_sec": requests as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        "latency_ms": {
            "p50": percentile_ms(&latencies, 50.0),
            "p95": percentile_ms(&latencies, 95.0),
            "p99": percentile_ms(&latencies, 99.0),
        },
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if failed > 0 {
        bail!("{} of {} requests failed", failed, requests);
    }
    Ok(())
}

/// Nearest-rank percentile of sorted samples
fn percentile_ms(sorted: &[Duration], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index].as_secs_f64() * 1000.0
}
