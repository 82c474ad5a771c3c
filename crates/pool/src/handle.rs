//! Worker handles
//!
//! A [`WorkerHandle`] is the manager's record of one worker process: the
//! child process, its socket, the multiplexed connection once established,
//! and the lifecycle state. Handles are owned by the pool manager; nothing
//! outside the crate can change their state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Child;
use tracing::{debug, warn};

use crate::connection::WorkerConnection;

/// Lifecycle of a worker process as seen by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Process launched, listener not yet confirmed
    Starting,
    /// Accepting requests
    Ready,
    /// Finishing in-flight work, no new requests
    Draining,
    /// Exited unexpectedly or stopped answering
    Crashed,
    /// Process reaped
    Terminated,
}

impl WorkerState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Starting, Ready)
                | (Starting, Draining)
                | (Starting, Crashed)
                | (Ready, Draining)
                | (Ready, Crashed)
                | (Draining, Crashed)
                | (Draining, Terminated)
                | (Crashed, Terminated)
        )
    }

    /// Counts toward the pool's desired size
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Ready)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminated)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "STARTING"),
            Self::Ready => write!(f, "READY"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Crashed => write!(f, "CRASHED"),
            Self::Terminated => write!(f, "TERMINATED"),
        }
    }
}

/// Point-in-time view of one worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub pid: Option<u32>,
    pub socket_path: PathBuf,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub in_flight: usize,
}

/// How a worker process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Exited on its own within the grace period
    Graceful,
    /// Killed after the grace period
    Forced,
}

pub struct WorkerHandle {
    id: String,
    socket_path: PathBuf,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    state: Mutex<WorkerState>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
    in_flight: AtomicUsize,
    missed_health_checks: AtomicU32,
    child: tokio::sync::Mutex<Child>,
    connection: OnceLock<Arc<WorkerConnection>>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkerHandle {
    pub(crate) fn new(id: String, socket_path: PathBuf, child: Child) -> Self {
        Self {
            id,
            socket_path,
            pid: child.id(),
            started_at: Utc::now(),
            state: Mutex::new(WorkerState::Starting),
            last_heartbeat: Mutex::new(None),
            in_flight: AtomicUsize::new(0),
            missed_health_checks: AtomicU32::new(0),
            child: tokio::sync::Mutex::new(child),
            connection: OnceLock::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// OS process id, captured at launch
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        *self.last_heartbeat.lock()
    }

    /// Requests dispatched to this worker and not yet answered
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            pid: self.pid,
            socket_path: self.socket_path.clone(),
            state: self.state(),
            started_at: self.started_at,
            last_heartbeat: self.last_heartbeat(),
            in_flight: self.in_flight(),
        }
    }

    /// Move to `next` if legal; returns false (and changes nothing) otherwise
    pub(crate) fn transition(&self, next: WorkerState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            return false;
        }
        let from = *state;
        debug!(worker_id = %self.id, %from, to = %next, "Worker state change");
        *state = next;
        true
    }

    /// Move `expected -> next` only if the worker is still in `expected`
    pub(crate) fn transition_from(&self, expected: WorkerState, next: WorkerState) -> bool {
        let mut state = self.state.lock();
        if *state != expected || !expected.can_transition_to(next) {
            return false;
        }
        debug!(worker_id = %self.id, from = %expected, to = %next, "Worker state change");
        *state = next;
        true
    }

    pub(crate) fn connection(&self) -> Option<Arc<WorkerConnection>> {
        self.connection.get().cloned()
    }

    pub(crate) fn attach(&self, connection: Arc<WorkerConnection>) {
        if self.connection.set(connection).is_err() {
            warn!(worker_id = %self.id, "Worker already has a connection");
        }
    }

    pub(crate) fn begin_request(self: &Arc<Self>) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    pub(crate) fn record_heartbeat(&self) {
        *self.last_heartbeat.lock() = Some(Utc::now());
        self.missed_health_checks.store(0, Ordering::SeqCst);
    }

    /// Count a failed health check; returns consecutive misses so far
    pub(crate) fn record_missed_health_check(&self) -> u32 {
        self.missed_health_checks.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Exit status if the process has already exited. Never blocks.
    pub(crate) fn exit_status(&self) -> Option<ExitStatus> {
        let Ok(mut child) = self.child.try_lock() else {
            // Someone is already waiting on the process
            return None;
        };
        match child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "Failed to poll worker process");
                None
            }
        }
    }

    /// Ask the worker to drain and exit
    pub(crate) fn signal_terminate(&self) -> bool {
        let Some(pid) = self.pid else {
            return false;
        };
        // SAFETY: kill(2) has no memory-safety preconditions; the pid belongs
        // to a child this handle has not reaped yet.
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        rc == 0
    }

    /// Wait up to `grace` for the process to exit, then kill it
    pub(crate) async fn reap(&self, grace: Duration) -> Exit {
        let mut child = self.child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(worker_id = %self.id, %status, "Worker exited");
                Exit::Graceful
            }
            Ok(Err(e)) => {
                warn!(worker_id = %self.id, error = %e, "Failed to wait for worker");
                let _ = child.kill().await;
                Exit::Forced
            }
            Err(_) => {
                warn!(
                    worker_id = %self.id,
                    grace_ms = grace.as_millis() as u64,
                    "Worker did not exit in time, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(worker_id = %self.id, error = %e, "Failed to kill worker");
                }
                Exit::Forced
            }
        }
    }

    /// Kill immediately and reap
    pub(crate) async fn kill(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(worker_id = %self.id, error = %e, "Kill failed (process already gone?)");
        }
    }

    pub(crate) fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(worker_id = %self.id, error = %e, "Failed to remove worker socket");
            }
        }
    }
}

/// Counts a dispatched request against its worker until dropped
pub(crate) struct InFlightGuard(Arc<WorkerHandle>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
