//! Sandbox policy
//!
//! The policy wraps action invocation; it never forks the server. Two variants:
//!
//! - [`SandboxPolicy::Unrestricted`] invokes the action directly.
//! - [`SandboxPolicy::Sandboxed`] checks declared capabilities before the call,
//!   gates filesystem/network/environment/subprocess access made through the
//!   [`ActionContext`](crate::ActionContext), and meters CPU time, resident
//!   memory and wall clock while the action runs.
//!
//! CPU time is attributed per task by reading the thread CPU clock around each
//! poll of the action future. On the worker's single cooperative thread this is
//! exactly the time the action itself spent running. A purely CPU-bound action
//! is only caught once it yields.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::action::{Action, ActionError};

// =============================================================================
// Types
// =============================================================================

/// Capability an action may declare or exercise through its context.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Filesystem,
    Network,
    Environment,
    Subprocess,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Filesystem => write!(f, "filesystem"),
            Self::Network => write!(f, "network"),
            Self::Environment => write!(f, "environment"),
            Self::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// Filesystem operation being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsOperation {
    Read,
    Write,
}

impl fmt::Display for FsOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Operation rejected by the sandbox. Distinct from an action failure: the
/// action was prevented from running as requested.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SandboxViolation {
    #[error("{operation} access to {} is not permitted", path.display())]
    PathDenied { path: PathBuf, operation: FsOperation },

    #[error("network egress to {host}:{port} is not permitted")]
    EgressDenied { host: String, port: u16 },

    #[error("capability '{capability}' is not permitted")]
    CapabilityDenied { capability: Capability },

    #[error("CPU time {used:?} exceeded the {limit:?} ceiling")]
    CpuTimeExceeded { used: Duration, limit: Duration },

    #[error("resident memory {used} bytes exceeded the {limit} byte ceiling")]
    MemoryExceeded { used: u64, limit: u64 },

    #[error("wall clock ceiling of {limit:?} exceeded")]
    WallClockExceeded { limit: Duration },
}

impl SandboxViolation {
    /// Machine-readable detail attached to the result error
    pub fn detail(&self) -> Value {
        match self {
            Self::PathDenied { path, operation } => serde_json::json!({
                "rule": "path",
                "path": path.display().to_string(),
                "operation": operation,
            }),
            Self::EgressDenied { host, port } => serde_json::json!({
                "rule": "egress",
                "host": host,
                "port": port,
            }),
            Self::CapabilityDenied { capability } => serde_json::json!({
                "rule": "capability",
                "capability": capability,
            }),
            Self::CpuTimeExceeded { used, limit } => serde_json::json!({
                "rule": "cpu_time",
                "used_ms": used.as_millis() as u64,
                "limit_ms": limit.as_millis() as u64,
            }),
            Self::MemoryExceeded { used, limit } => serde_json::json!({
                "rule": "memory",
                "used_bytes": used,
                "limit_bytes": limit,
            }),
            Self::WallClockExceeded { limit } => serde_json::json!({
                "rule": "wall_clock",
                "limit_ms": limit.as_millis() as u64,
            }),
        }
    }
}

/// Selects the policy variant at worker startup
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    #[default]
    Unrestricted,
    Sandboxed,
}

impl fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrestricted => write!(f, "unrestricted"),
            Self::Sandboxed => write!(f, "sandboxed"),
        }
    }
}

/// Restrictions enforced by the sandboxed variant.
///
/// Filesystem access is denied unless the path lies under an allowed root and
/// under no denied root. Network egress is denied unless the host matches an
/// allowed pattern (`host`, `host:port`, `*.suffix`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxRules {
    #[serde(default)]
    pub allowed_paths: Vec<PathBuf>,

    #[serde(default)]
    pub denied_paths: Vec<PathBuf>,

    #[serde(default)]
    pub allowed_hosts: Vec<String>,

    #[serde(default)]
    pub denied_capabilities: BTreeSet<Capability>,

    #[serde(default, with = "option_duration_millis")]
    pub cpu_time: Option<Duration>,

    #[serde(default, with = "option_duration_millis")]
    pub wall_clock: Option<Duration>,

    #[serde(default)]
    pub memory_bytes: Option<u64>,
}

impl Default for SandboxRules {
    fn default() -> Self {
        Self {
            allowed_paths: vec![],
            denied_paths: vec![],
            allowed_hosts: vec![],
            denied_capabilities: [Capability::Environment, Capability::Subprocess]
                .into_iter()
                .collect(),
            cpu_time: Some(Duration::from_secs(30)),
            wall_clock: Some(Duration::from_secs(300)),
            memory_bytes: None,
        }
    }
}

impl SandboxRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.allowed_paths.push(path.into());
        self
    }

    pub fn deny_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.denied_paths.push(path.into());
        self
    }

    pub fn allow_host(mut self, pattern: impl Into<String>) -> Self {
        self.allowed_hosts.push(pattern.into());
        self
    }

    pub fn deny_capability(mut self, capability: Capability) -> Self {
        self.denied_capabilities.insert(capability);
        self
    }

    pub fn permit_capability(mut self, capability: Capability) -> Self {
        self.denied_capabilities.remove(&capability);
        self
    }

    pub fn with_cpu_time(mut self, limit: Option<Duration>) -> Self {
        self.cpu_time = limit;
        self
    }

    pub fn with_wall_clock(mut self, limit: Option<Duration>) -> Self {
        self.wall_clock = limit;
        self
    }

    pub fn with_memory_bytes(mut self, limit: Option<u64>) -> Self {
        self.memory_bytes = limit;
        self
    }

    fn check_capability(&self, capability: Capability) -> Result<(), SandboxViolation> {
        if self.denied_capabilities.contains(&capability) {
            return Err(SandboxViolation::CapabilityDenied { capability });
        }
        Ok(())
    }

    fn check_path(&self, path: &Path, operation: FsOperation) -> Result<PathBuf, SandboxViolation> {
        self.check_capability(Capability::Filesystem)?;

        let resolved = resolve_path(path);
        let denied = || SandboxViolation::PathDenied {
            path: resolved.clone(),
            operation,
        };

        if self
            .denied_paths
            .iter()
            .any(|root| resolved.starts_with(resolve_path(root)))
        {
            return Err(denied());
        }
        if !self
            .allowed_paths
            .iter()
            .any(|root| resolved.starts_with(resolve_path(root)))
        {
            return Err(denied());
        }
        Ok(resolved)
    }

    fn check_egress(&self, host: &str, port: u16) -> Result<(), SandboxViolation> {
        self.check_capability(Capability::Network)?;

        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if self
            .allowed_hosts
            .iter()
            .any(|pattern| host_matches(pattern, &host, port))
        {
            return Ok(());
        }
        Err(SandboxViolation::EgressDenied { host, port })
    }
}

fn host_matches(pattern: &str, host: &str, port: u16) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let (pattern_host, pattern_port) = match pattern.rsplit_once(':') {
        Some((h, p)) => match p.parse::<u16>() {
            Ok(p) => (h.to_string(), Some(p)),
            Err(_) => (pattern.clone(), None),
        },
        None => (pattern.clone(), None),
    };

    if pattern_port.is_some_and(|p| p != port) {
        return false;
    }
    if pattern_host == "*" {
        return true;
    }
    match pattern_host.strip_prefix("*.") {
        Some(suffix) => host.ends_with(&format!(".{}", suffix)),
        None => pattern_host == host,
    }
}

/// Absolute, `..`-free form of `path` with symlinks in its existing prefix
/// resolved, so `allowed/../../etc` or a symlink out of an allowed root cannot
/// slip past a prefix check.
pub fn resolve_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    // Canonicalize the deepest existing ancestor, keep the rest verbatim
    let mut existing = normalized.clone();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut out = canonical;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => return normalized,
        }
    }
}

// =============================================================================
// Capability guard handed to actions
// =============================================================================

/// Per-request view of the active policy, carried by the action context.
#[derive(Debug, Clone, Default)]
pub struct CapabilityGuard {
    rules: Option<Arc<SandboxRules>>,
}

impl CapabilityGuard {
    pub fn unrestricted() -> Self {
        Self { rules: None }
    }

    pub fn is_sandboxed(&self) -> bool {
        self.rules.is_some()
    }

    pub fn require(&self, capability: Capability) -> Result<(), SandboxViolation> {
        match &self.rules {
            Some(rules) => rules.check_capability(capability),
            None => Ok(()),
        }
    }

    /// Returns the path to operate on (resolved when sandboxed)
    pub fn check_path(
        &self,
        path: &Path,
        operation: FsOperation,
    ) -> Result<PathBuf, SandboxViolation> {
        match &self.rules {
            Some(rules) => rules.check_path(path, operation),
            None => Ok(path.to_path_buf()),
        }
    }

    pub fn check_egress(&self, host: &str, port: u16) -> Result<(), SandboxViolation> {
        match &self.rules {
            Some(rules) => rules.check_egress(host, port),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Policy
// =============================================================================

/// Boxed action future as produced by the executor
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'a>>;

/// Tagged policy variant wrapping every invocation
#[derive(Debug, Clone, Default)]
pub enum SandboxPolicy {
    #[default]
    Unrestricted,
    Sandboxed(Arc<SandboxRules>),
}

impl SandboxPolicy {
    pub fn from_mode(mode: SandboxMode, rules: SandboxRules) -> Self {
        match mode {
            SandboxMode::Unrestricted => Self::Unrestricted,
            SandboxMode::Sandboxed => Self::Sandboxed(Arc::new(rules)),
        }
    }

    pub fn sandboxed(rules: SandboxRules) -> Self {
        Self::Sandboxed(Arc::new(rules))
    }

    pub fn mode(&self) -> SandboxMode {
        match self {
            Self::Unrestricted => SandboxMode::Unrestricted,
            Self::Sandboxed(_) => SandboxMode::Sandboxed,
        }
    }

    /// Guard for the action context of a single request
    pub fn guard(&self) -> CapabilityGuard {
        match self {
            Self::Unrestricted => CapabilityGuard::unrestricted(),
            Self::Sandboxed(rules) => CapabilityGuard {
                rules: Some(Arc::clone(rules)),
            },
        }
    }

    /// Checks run before the action is invoked at all
    pub fn preflight(&self, action: &dyn Action) -> Result<(), SandboxViolation> {
        let Self::Sandboxed(rules) = self else {
            return Ok(());
        };
        for capability in action.capabilities() {
            rules.check_capability(*capability)?;
        }
        Ok(())
    }

    /// Run an already-built action future under this policy's ceilings
    pub async fn enforce(&self, invocation: ActionFuture<'_>) -> Result<Value, ActionError> {
        let rules = match self {
            Self::Unrestricted => return invocation.await,
            Self::Sandboxed(rules) => rules,
        };

        let metered = Metered {
            inner: invocation,
            cpu_used: Duration::ZERO,
            cpu_limit: rules.cpu_time,
            memory_limit: rules.memory_bytes,
        };

        match rules.wall_clock {
            Some(limit) => tokio::time::timeout(limit, metered)
                .await
                .unwrap_or(Err(SandboxViolation::WallClockExceeded { limit }.into())),
            None => metered.await,
        }
    }
}

/// Accumulates the thread CPU time spent inside each poll of `inner`
struct Metered<'a> {
    inner: ActionFuture<'a>,
    cpu_used: Duration,
    cpu_limit: Option<Duration>,
    memory_limit: Option<u64>,
}

impl Future for Metered<'_> {
    type Output = Result<Value, ActionError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let started = thread_cpu_time();
        let polled = this.inner.as_mut().poll(cx);
        this.cpu_used += thread_cpu_time().saturating_sub(started);

        if let Some(limit) = this.cpu_limit {
            if this.cpu_used > limit {
                return Poll::Ready(Err(SandboxViolation::CpuTimeExceeded {
                    used: this.cpu_used,
                    limit,
                }
                .into()));
            }
        }
        if let Some(limit) = this.memory_limit {
            if let Some(used) = resident_memory_bytes() {
                if used > limit {
                    let violation = SandboxViolation::MemoryExceeded { used, limit };
                    return Poll::Ready(Err(violation.into()));
                }
            }
        }

        polled
    }
}

/// CPU time consumed by the calling thread
pub fn thread_cpu_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Resident set size of this process, where the platform exposes it
#[cfg(target_os = "linux")]
pub fn resident_memory_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no memory-safety preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
pub fn resident_memory_bytes() -> Option<u64> {
    None
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
