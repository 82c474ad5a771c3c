//! Worker startup configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use warmpool_protocol::DEFAULT_MAX_FRAME_LEN;

use crate::error::ServerError;
use crate::sandbox::{SandboxMode, SandboxPolicy, SandboxRules};

/// Configuration for one worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identifier assigned by the pool manager
    pub worker_id: String,

    /// Local socket the worker listens on
    pub socket_path: PathBuf,

    /// Skip action resolution and return a canned success for every request
    pub test_mode: bool,

    /// Sandbox variant selected at startup
    pub sandbox_mode: SandboxMode,

    /// Restrictions applied when `sandbox_mode` is sandboxed
    pub sandbox_rules: SandboxRules,

    /// Maximum actions executing concurrently; extra requests wait
    pub max_concurrent: usize,

    /// How long in-flight requests may run after a termination signal
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    /// Largest accepted frame body
    pub max_frame_len: usize,

    /// Exit when stdin reaches EOF (the manager went away)
    pub watch_parent: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let worker_id = format!("worker-{}", Uuid::now_v7());
        Self {
            socket_path: std::env::temp_dir().join(format!("warmpool-{}.sock", worker_id)),
            worker_id,
            test_mode: false,
            sandbox_mode: SandboxMode::Unrestricted,
            sandbox_rules: SandboxRules::default(),
            max_concurrent: 256,
            shutdown_grace: Duration::from_secs(30),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            watch_parent: false,
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_id: worker_id.into(),
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn with_sandbox(mut self, mode: SandboxMode, rules: SandboxRules) -> Self {
        self.sandbox_mode = mode;
        self.sandbox_rules = rules;
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    pub fn with_watch_parent(mut self, watch: bool) -> Self {
        self.watch_parent = watch;
        self
    }

    pub fn sandbox_policy(&self) -> SandboxPolicy {
        SandboxPolicy::from_mode(self.sandbox_mode, self.sandbox_rules.clone())
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.worker_id.trim().is_empty() {
            return Err(ServerError::Config("worker_id must not be empty".into()));
        }
        if self.socket_path.as_os_str().is_empty() {
            return Err(ServerError::Config("socket path must not be empty".into()));
        }
        if self.max_frame_len == 0 {
            return Err(ServerError::Config("max_frame_len must be positive".into()));
        }
        Ok(())
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
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
