//! Worker process entry point
//!
//! The pool manager launches workers with [`worker_args`] and the worker
//! binary parses them back with [`WorkerArgs`]. Every flag can also be set
//! from the environment for running a worker by hand.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::io::AsyncReadExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use warmpool_protocol::DEFAULT_MAX_FRAME_LEN;

use crate::action::ActionRegistry;
use crate::config::WorkerConfig;
use crate::error::ServerError;
use crate::executor::ActionExecutor;
use crate::sandbox::{Capability, SandboxMode, SandboxRules};
use crate::server::WorkerServer;
use crate::telemetry::{init_telemetry, TelemetryConfig};
use crate::testing;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "warmpool-worker")]
#[command(about = "Warm worker process serving action requests over a local socket")]
#[command(version)]
pub struct WorkerArgs {
    /// Identifier assigned by the pool manager
    #[arg(long, env = "WARMPOOL_WORKER_ID")]
    pub worker_id: String,

    /// Unix socket path to listen on
    #[arg(long, env = "WARMPOOL_WORKER_SOCKET")]
    pub socket: PathBuf,

    /// Return a canned success for every request without running actions
    #[arg(long, env = "WARMPOOL_TEST_MODE")]
    pub test_mode: bool,

    /// Sandbox variant
    #[arg(long, value_enum, env = "WARMPOOL_SANDBOX", default_value_t = SandboxMode::Unrestricted)]
    pub sandbox: SandboxMode,

    /// Filesystem root actions may use (repeatable)
    #[arg(long = "allow-path", value_name = "PATH")]
    pub allow_paths: Vec<PathBuf>,

    /// Filesystem root actions may never use (repeatable)
    #[arg(long = "deny-path", value_name = "PATH")]
    pub deny_paths: Vec<PathBuf>,

    /// Egress host pattern: host, host:port or *.suffix (repeatable)
    #[arg(long = "allow-host", value_name = "PATTERN")]
    pub allow_hosts: Vec<String>,

    /// Capability to deny; replaces the default denials when given (repeatable)
    #[arg(long = "deny-capability", value_enum, value_name = "CAPABILITY")]
    pub deny_capabilities: Vec<Capability>,

    /// Capability to permit even if denied by default (repeatable)
    #[arg(long = "permit-capability", value_enum, value_name = "CAPABILITY")]
    pub permit_capabilities: Vec<Capability>,

    /// CPU time ceiling per request in milliseconds (0 disables)
    #[arg(long, value_name = "MS")]
    pub cpu_time_ms: Option<u64>,

    /// Wall clock ceiling per request in milliseconds (0 disables)
    #[arg(long, value_name = "MS")]
    pub wall_clock_ms: Option<u64>,

    /// Resident memory ceiling in MiB
    #[arg(long, value_name = "MB")]
    pub memory_mb: Option<u64>,

    /// Maximum concurrently executing actions
    #[arg(long, env = "WARMPOOL_MAX_CONCURRENT", default_value_t = 256)]
    pub max_concurrent: usize,

    /// Grace period for in-flight requests after SIGTERM
    #[arg(long, env = "WARMPOOL_WORKER_SHUTDOWN_GRACE_MS", default_value_t = 30_000)]
    pub shutdown_grace_ms: u64,

    /// Largest accepted frame body in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_len: usize,

    /// Exit when stdin closes
    #[arg(long)]
    pub watch_parent: bool,
}

impl WorkerArgs {
    pub fn into_config(self) -> WorkerConfig {
        let defaults = SandboxRules::default();

        let mut rules = SandboxRules {
            allowed_paths: self.allow_paths,
            denied_paths: self.deny_paths,
            allowed_hosts: self.allow_hosts,
            ..defaults.clone()
        };
        if !self.deny_capabilities.is_empty() {
            rules.denied_capabilities = self.deny_capabilities.into_iter().collect();
        }
        for capability in self.permit_capabilities {
            rules.denied_capabilities.remove(&capability);
        }
        rules.cpu_time = ceiling(self.cpu_time_ms, defaults.cpu_time);
        rules.wall_clock = ceiling(self.wall_clock_ms, defaults.wall_clock);
        rules.memory_bytes = self.memory_mb.map(|mb| mb.saturating_mul(BYTES_PER_MB));

        WorkerConfig::new(self.worker_id, self.socket)
            .with_test_mode(self.test_mode)
            .with_sandbox(self.sandbox, rules)
            .with_max_concurrent(self.max_concurrent)
            .with_shutdown_grace(Duration::from_millis(self.shutdown_grace_ms))
            .with_max_frame_len(self.max_frame_len)
            .with_watch_parent(self.watch_parent)
    }
}

fn ceiling(flag: Option<u64>, default: Option<Duration>) -> Option<Duration> {
    match flag {
        None => default,
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
    }
}

/// Command-line arguments (without the program name) that reproduce `config`
pub fn worker_args(config: &WorkerConfig) -> Vec<String> {
    let mut args = vec![
        "--worker-id".to_string(),
        config.worker_id.clone(),
        "--socket".to_string(),
        config.socket_path.display().to_string(),
        "--sandbox".to_string(),
        config.sandbox_mode.to_string(),
        "--max-concurrent".to_string(),
        config.max_concurrent.to_string(),
        "--shutdown-grace-ms".to_string(),
        (config.shutdown_grace.as_millis() as u64).to_string(),
        "--max-frame-len".to_string(),
        config.max_frame_len.to_string(),
    ];
    if config.test_mode {
        args.push("--test-mode".to_string());
    }
    if config.watch_parent {
        args.push("--watch-parent".to_string());
    }

    let rules = &config.sandbox_rules;
    for path in &rules.allowed_paths {
        args.push("--allow-path".to_string());
        args.push(path.display().to_string());
    }
    for path in &rules.denied_paths {
        args.push("--deny-path".to_string());
        args.push(path.display().to_string());
    }
    for host in &rules.allowed_hosts {
        args.push("--allow-host".to_string());
        args.push(host.clone());
    }
    // Spell out every capability so the parsed set matches exactly
    for capability in Capability::value_variants() {
        let flag = if rules.denied_capabilities.contains(capability) {
            "--deny-capability"
        } else {
            "--permit-capability"
        };
        args.push(flag.to_string());
        args.push(capability.to_string());
    }
    args.push("--cpu-time-ms".to_string());
    args.push(millis_or_zero(rules.cpu_time));
    args.push("--wall-clock-ms".to_string());
    args.push(millis_or_zero(rules.wall_clock));
    if let Some(bytes) = rules.memory_bytes {
        args.push("--memory-mb".to_string());
        args.push(bytes.div_ceil(BYTES_PER_MB).to_string());
    }
    args
}

fn millis_or_zero(limit: Option<Duration>) -> String {
    limit.map(|d| d.as_millis() as u64).unwrap_or(0).to_string()
}

/// Parse the process arguments and run a worker with the built-in actions
pub fn main_entry() -> Result<()> {
    let args = WorkerArgs::parse();

    let mut telemetry = TelemetryConfig::from_env("warmpool-worker");
    if telemetry.log_filter.is_none() {
        telemetry.log_filter = Some("warmpool_worker=info".to_string());
    }
    init_telemetry(&telemetry);

    // Single cooperative loop per worker process
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build worker runtime")?;

    runtime.block_on(run(args.into_config(), Arc::new(testing::registry())))
}

/// Run a worker until SIGTERM/SIGINT (or parent exit, if watched) and drain
pub async fn run(config: WorkerConfig, registry: Arc<dyn ActionRegistry>) -> Result<()> {
    config.validate()?;
    info!(
        worker_id = %config.worker_id,
        pid = std::process::id(),
        actions = registry.names().len(),
        "Worker starting"
    );

    let executor = ActionExecutor::new(registry, config.sandbox_policy());
    let server = WorkerServer::new(config, executor);
    let listener = server.bind()?;

    install_signal_handlers(server.shutdown_token())?;
    if server.config().watch_parent {
        watch_parent(server.shutdown_token());
    }

    server.serve(listener).await;
    Ok(())
}

fn install_signal_handlers(shutdown: CancellationToken) -> Result<(), ServerError> {
    let mut terminate = signal(SignalKind::terminate()).map_err(ServerError::Signal)?;
    let mut interrupt = signal(SignalKind::interrupt()).map_err(ServerError::Signal)?;

    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
            _ = interrupt.recv() => info!("Received SIGINT, shutting down"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
    Ok(())
}

/// Treat EOF on stdin as the manager going away
fn watch_parent(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 64];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                read = stdin.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                },
            }
        }
        debug!("Parent closed stdin");
        info!("Parent process gone, shutting down");
        shutdown.cancel();
    });
}
