//! # Warmpool pool manager
//!
//! Keeps a fixed number of warm worker processes alive and dispatches action
//! requests to them over local sockets.
//!
//! - [`PoolManager`]: start, submit, resize, shutdown
//! - [`WorkerHandle`]: one worker process and its lifecycle state
//! - [`WorkerConnection`]: multiplexed request/result stream to one worker
//! - [`RetryPolicy`]: backoff between attempts of the same request

pub mod config;
pub mod connection;
pub mod error;
pub mod handle;
pub mod manager;
pub mod retry;

pub use config::{default_worker_program, PoolConfig, SandboxPolicyConfig, WORKER_PROGRAM_NAME};
pub use connection::WorkerConnection;
pub use error::{DispatchError, PoolError};
pub use handle::{WorkerHandle, WorkerSnapshot, WorkerState};
pub use manager::{PoolLifecycle, PoolManager, PoolStatus};
pub use retry::RetryPolicy;

// Wire types callers build requests from
pub use warmpool_protocol::{
    ErrorKind, ExecutionRequest, ExecutionResult, ExecutionStatus, RunContext,
};
