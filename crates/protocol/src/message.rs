//! Request, result and frame types

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ============================================================================
// Run context
// ============================================================================

/// Per-run identifiers and credentials travelling with a single request.
///
/// Workers never cache a context beyond the request that carried it.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,

    /// Secrets resolved for this run (API keys, tokens)
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub credentials: HashMap<String, String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workspace(mut self, id: impl Into<String>) -> Self {
        self.workspace_id = Some(id.into());
        self
    }

    pub fn with_workflow(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    pub fn with_run(mut self, id: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self
    }

    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(String::as_str)
    }
}

// Credentials must never reach logs.
impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.credentials.keys().map(String::as_str).collect();
        keys.sort_unstable();
        f.debug_struct("RunContext")
            .field("workspace_id", &self.workspace_id)
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .field("credentials", &keys)
            .finish()
    }
}

// ============================================================================
// Execution request
// ============================================================================

/// A single action invocation submitted to the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique per submission
    pub request_id: Uuid,

    /// Registry name of the action, e.g. `testing.add_100`
    pub action_name: String,

    #[serde(default)]
    pub args: Map<String, Value>,

    #[serde(default)]
    pub context: RunContext,

    /// Relative timeout, enforced by the manager per attempt
    #[serde(rename = "deadline_ms", with = "duration_millis")]
    pub deadline: Duration,

    /// Dispatch attempt this copy was sent as. Set by the manager and echoed
    /// back in the result so a late answer to an earlier attempt is not
    /// mistaken for the current one.
    #[serde(default)]
    pub attempt: u32,
}

impl ExecutionRequest {
    /// Default deadline applied when none is set explicitly
    pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

    pub fn new(action_name: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::now_v7(),
            action_name: action_name.into(),
            args: Map::new(),
            context: RunContext::default(),
            deadline: Self::DEFAULT_DEADLINE,
            attempt: 0,
        }
    }

    /// Replace all arguments. Non-object values are ignored.
    pub fn with_args(mut self, args: Value) -> Self {
        if let Value::Object(map) = args {
            self.args = map;
        }
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(name.into(), value.into());
        self
    }

    pub fn with_context(mut self, context: RunContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }
}

// ============================================================================
// Execution result
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
}

/// Error taxonomy shared by workers and the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed frame or transport desync
    ProtocolError,
    /// Worker process exited unexpectedly
    WorkerCrashError,
    /// Deadline exceeded while awaiting a response
    TimeoutError,
    /// Isolation policy rejected the action
    SandboxViolation,
    /// The action itself failed
    ActionExecutionError,
    /// Retries exhausted or no ready worker
    WorkerUnavailable,
}

impl ErrorKind {
    /// Infrastructure faults are retried against another worker; semantic
    /// faults are deterministic for a given input and returned as-is.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::ProtocolError | Self::WorkerCrashError | Self::TimeoutError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ProtocolError => "ProtocolError",
            Self::WorkerCrashError => "WorkerCrashError",
            Self::TimeoutError => "TimeoutError",
            Self::SandboxViolation => "SandboxViolation",
            Self::ActionExecutionError => "ActionExecutionError",
            Self::WorkerUnavailable => "WorkerUnavailable",
        };
        f.write_str(name)
    }
}

/// Structured error carried inside a failed result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one request. `payload` is present iff `status` is success,
/// `error` iff it is error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: Uuid,
    pub status: ExecutionStatus,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub payload: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,

    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,

    /// Copied from the request's `attempt`
    #[serde(default)]
    pub attempt: u32,
}

impl ExecutionResult {
    pub fn success(request_id: Uuid, payload: Value, duration: Duration) -> Self {
        Self {
            request_id,
            status: ExecutionStatus::Success,
            payload: Some(payload),
            error: None,
            duration,
            attempt: 0,
        }
    }

    pub fn failure(request_id: Uuid, error: ExecutionError, duration: Duration) -> Self {
        Self {
            request_id,
            status: ExecutionStatus::Error,
            payload: None,
            error: Some(error),
            duration,
            attempt: 0,
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

/// A present `payload` field is always `Some`, even when it holds `null`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

// ============================================================================
// Frame envelope
// ============================================================================

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Manager -> worker: run an action
    Execute(ExecutionRequest),
    /// Worker -> manager: outcome of an `Execute`
    Result(ExecutionResult),
    /// Manager -> worker: liveness check
    Ping { nonce: u64 },
    /// Worker -> manager: ping answer with the worker's current load
    Pong { nonce: u64, in_flight: usize },
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
