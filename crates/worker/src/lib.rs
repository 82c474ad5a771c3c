//! # Warmpool worker
//!
//! A long-lived process that serves action requests from the pool manager
//! over a local socket. Requests run concurrently on a single cooperative
//! loop; each one resolves an action by name, runs it through the configured
//! sandbox policy and answers with an `ExecutionResult`. Nothing survives a
//! request except the process itself.

pub mod action;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod sandbox;
pub mod server;
pub mod telemetry;
pub mod testing;

// Re-export main types
pub use action::{
    optional_arg, required_arg, Action, ActionContext, ActionError, ActionRegistry,
    StaticActionRegistry,
};
pub use cli::{worker_args, WorkerArgs};
pub use config::WorkerConfig;
pub use error::ServerError;
pub use executor::ActionExecutor;
pub use sandbox::{Capability, SandboxMode, SandboxPolicy, SandboxRules, SandboxViolation};
pub use server::{test_mode_payload, WorkerServer};
pub use telemetry::{init_telemetry, LogFormat, TelemetryConfig};
