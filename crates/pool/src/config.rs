//! Pool configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warmpool_protocol::DEFAULT_MAX_FRAME_LEN;
use warmpool_worker::{SandboxMode, SandboxRules, WorkerConfig};

use crate::retry::RetryPolicy;

/// Name of the worker binary looked up next to the current executable
pub const WORKER_PROGRAM_NAME: &str = "warmpool-worker";

/// Sandbox variant and rules handed to every worker at startup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxPolicyConfig {
    pub mode: SandboxMode,

    #[serde(default)]
    pub rules: SandboxRules,
}

impl SandboxPolicyConfig {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn sandboxed(rules: SandboxRules) -> Self {
        Self {
            mode: SandboxMode::Sandboxed,
            rules,
        }
    }
}

/// Pool manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Worker executable
    pub worker_program: PathBuf,

    /// Directory that holds the per-worker sockets
    pub socket_dir: PathBuf,

    /// Number of workers kept running
    pub desired_size: usize,

    /// Extra attempts after the first for infrastructure faults
    pub max_retries_per_request: u32,

    /// Interval of the background health-check loop
    #[serde(with = "duration_millis")]
    pub health_check_interval: Duration,

    /// How long a worker has to answer a health-check ping
    #[serde(with = "duration_millis")]
    pub health_check_timeout: Duration,

    /// Consecutive failed health checks before a live process is declared crashed
    pub max_missed_health_checks: u32,

    /// How long a new worker has to become READY
    #[serde(with = "duration_millis")]
    pub startup_timeout: Duration,

    /// Launch attempts per worker slot during `start`
    pub startup_retries: u32,

    /// Default grace period for draining workers
    #[serde(with = "duration_millis")]
    pub shutdown_grace_period: Duration,

    /// Deadline for requests that do not carry their own
    #[serde(with = "duration_millis")]
    pub default_deadline: Duration,

    /// Delay schedule between attempts
    pub retry_backoff: RetryPolicy,

    /// Start workers in test mode (canned results, no real actions)
    pub test_mode: bool,

    /// Sandbox variant for every worker
    pub sandbox: SandboxPolicyConfig,

    /// Concurrently executing actions per worker
    pub max_concurrent_per_worker: usize,

    /// Largest frame body accepted in either direction
    pub max_frame_len: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_program: default_worker_program(),
            socket_dir: std::env::temp_dir(),
            desired_size: 4,
            max_retries_per_request: 2,
            health_check_interval: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(1),
            max_missed_health_checks: 3,
            startup_timeout: Duration::from_secs(10),
            startup_retries: 3,
            shutdown_grace_period: Duration::from_secs(30),
            default_deadline: Duration::from_secs(60),
            retry_backoff: RetryPolicy::default(),
            test_mode: false,
            sandbox: SandboxPolicyConfig::default(),
            max_concurrent_per_worker: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl PoolConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `WARMPOOL_WORKER_PROGRAM`: Worker executable (default: next to the current binary)
    /// - `WARMPOOL_SOCKET_DIR`: Socket directory (default: system temp dir)
    /// - `WARMPOOL_SIZE`: Pool size (default: 4)
    /// - `WARMPOOL_MAX_RETRIES`: Retries per request (default: 2)
    /// - `WARMPOOL_HEALTH_CHECK_INTERVAL_MS`: Health-check interval (default: 5000)
    /// - `WARMPOOL_SHUTDOWN_GRACE_MS`: Shutdown grace period (default: 30000)
    /// - `WARMPOOL_TEST_MODE`: "true" to start workers in test mode
    /// - `WARMPOOL_SANDBOX`: "unrestricted" (default) or "sandboxed"
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_program: std::env::var("WARMPOOL_WORKER_PROGRAM")
                .map(PathBuf::from)
                .unwrap_or(defaults.worker_program),
            socket_dir: std::env::var("WARMPOOL_SOCKET_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.socket_dir),
            desired_size: env_parse("WARMPOOL_SIZE").unwrap_or(defaults.desired_size),
            max_retries_per_request: env_parse("WARMPOOL_MAX_RETRIES")
                .unwrap_or(defaults.max_retries_per_request),
            health_check_interval: env_parse("WARMPOOL_HEALTH_CHECK_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.health_check_interval),
            shutdown_grace_period: env_parse("WARMPOOL_SHUTDOWN_GRACE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_grace_period),
            test_mode: std::env::var("WARMPOOL_TEST_MODE")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(false),
            sandbox: SandboxPolicyConfig {
                mode: match std::env::var("WARMPOOL_SANDBOX").as_deref() {
                    Ok("sandboxed") => SandboxMode::Sandboxed,
                    _ => SandboxMode::Unrestricted,
                },
                rules: SandboxRules::default(),
            },
            ..defaults
        }
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = dir.into();
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.desired_size = size;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries_per_request = retries;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_health_check_timeout(mut self, timeout: Duration) -> Self {
        self.health_check_timeout = timeout;
        self
    }

    pub fn with_max_missed_health_checks(mut self, missed: u32) -> Self {
        self.max_missed_health_checks = missed.max(1);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_startup_retries(mut self, retries: u32) -> Self {
        self.startup_retries = retries.max(1);
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn with_retry_backoff(mut self, policy: RetryPolicy) -> Self {
        self.retry_backoff = policy;
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxPolicyConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_max_concurrent_per_worker(mut self, max: usize) -> Self {
        self.max_concurrent_per_worker = max.max(1);
        self
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Total attempts allowed for one request
    pub fn max_attempts(&self) -> u32 {
        self.max_retries_per_request.saturating_add(1)
    }

    /// Startup configuration for one worker process
    pub fn worker_config(&self, worker_id: &str, socket_path: &Path) -> WorkerConfig {
        WorkerConfig::new(worker_id, socket_path)
            .with_test_mode(self.test_mode)
            .with_sandbox(self.sandbox.mode, self.sandbox.rules.clone())
            .with_max_concurrent(self.max_concurrent_per_worker)
            .with_shutdown_grace(self.shutdown_grace_period)
            .with_max_frame_len(self.max_frame_len)
            .with_watch_parent(true)
    }
}

/// `warmpool-worker` next to the running executable, else from `PATH`
pub fn default_worker_program() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_PROGRAM_NAME)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from(WORKER_PROGRAM_NAME))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
