use std::time::Duration;

use uuid::Uuid;
use warmpool_protocol::ErrorKind;

/// Errors surfaced by the pool manager itself.
///
/// Requests that reach a worker always come back as an `ExecutionResult`;
/// these errors cover the cases where no result could be obtained at all.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Retries exhausted, or no READY worker could be found in time
    #[error("no worker available for request {request_id} after {attempts} attempt(s): {reason}")]
    WorkerUnavailable {
        request_id: Uuid,
        attempts: u32,
        reason: String,
    },

    /// `start` could not bring every worker to READY
    #[error("pool failed to initialize: {0}")]
    PoolInitialization(String),

    /// A request with this id is still outstanding
    #[error("request {0} is already outstanding")]
    DuplicateRequestId(Uuid),

    /// The pool has not been started (or has been shut down)
    #[error("worker pool is not running")]
    NotRunning,

    /// The pool is draining
    #[error("worker pool is shutting down")]
    ShuttingDown,

    /// `start` called on a pool that is already up
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// The worker program could not be launched
    #[error("failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: String,
        #[source]
        source: std::io::Error,
    },
}

impl PoolError {
    /// Error kind reported to callers that flatten errors into results
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::WorkerUnavailable { .. } => Some(ErrorKind::WorkerUnavailable),
            _ => None,
        }
    }
}

/// Infrastructure fault observed on a single dispatch attempt.
///
/// These are never shown to callers directly; the manager retries them on a
/// different worker and only reports `WorkerUnavailable` once the budget is
/// spent.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DispatchError {
    /// Malformed frame or transport desync
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The worker process exited or its transport failed
    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    /// No response before the deadline
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::WorkerCrash(_) => ErrorKind::WorkerCrashError,
            Self::Timeout(_) => ErrorKind::TimeoutError,
        }
    }

    /// Whether the worker that produced this fault should be replaced
    pub fn is_fatal_to_worker(&self) -> bool {
        !matches!(self, Self::Timeout(_))
    }
}
