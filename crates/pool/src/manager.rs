//! Pool manager
//!
//! Owns the worker process table: starts workers, dispatches requests to
//! READY workers, health-checks them on a fixed interval, replaces the ones
//! that crash, and drains everything on shutdown.
//!
//! Each worker multiplexes many requests over one connection, so dispatch
//! only has to pick *a* READY worker (least loaded, round robin on ties).
//! Infrastructure faults are retried on a different worker; semantic faults
//! come back verbatim in the result.

use std::fmt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashSet;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use warmpool_protocol::{ErrorKind, ExecutionRequest, ExecutionResult, FrameCodec};
use warmpool_worker::worker_args;

use crate::config::PoolConfig;
use crate::connection::WorkerConnection;
use crate::error::{DispatchError, PoolError};
use crate::handle::{Exit, WorkerHandle, WorkerSnapshot, WorkerState};

/// Pause between readiness pings of a starting worker
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolLifecycle {
    /// Not started, or fully shut down
    Stopped,
    /// `start` in progress
    Starting,
    /// Accepting requests
    Running,
    /// `shutdown` in progress
    Draining,
}

impl fmt::Display for PoolLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub lifecycle: PoolLifecycle,
    pub desired_size: usize,
    /// Workers declared crashed since the pool was created
    pub crashes: u64,
    /// Workers in startup order
    pub workers: Vec<WorkerSnapshot>,
}

impl PoolStatus {
    pub fn ready_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Ready)
            .count()
    }
}

struct Inner {
    config: PoolConfig,
    /// Keeps socket names unique across pools sharing a directory
    pool_tag: String,
    desired_size: AtomicUsize,
    lifecycle: RwLock<PoolLifecycle>,
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
    next_worker: AtomicU64,
    cursor: AtomicUsize,
    outstanding: DashSet<Uuid>,
    ready_changed: Notify,
    health_loop: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    crashes: AtomicU64,
}

/// Warm worker pool
///
/// Cheap to clone; clones share the same pool.
///
/// # Example
///
/// ```ignore
/// use warmpool_pool::{PoolConfig, PoolManager};
/// use warmpool_protocol::ExecutionRequest;
///
/// let pool = PoolManager::new(PoolConfig::from_env());
/// pool.start(4).await?;
///
/// let result = pool
///     .submit(ExecutionRequest::new("testing.add_100").with_arg("num", 5))
///     .await?;
/// assert_eq!(result.payload, Some(serde_json::json!(105)));
///
/// pool.shutdown(Duration::from_secs(30)).await?;
/// ```
#[derive(Clone)]
pub struct PoolManager {
    inner: Arc<Inner>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        let desired_size = config.desired_size;
        Self {
            inner: Arc::new(Inner {
                config,
                pool_tag: format!("{:08x}", rand::random::<u32>()),
                desired_size: AtomicUsize::new(desired_size),
                lifecycle: RwLock::new(PoolLifecycle::Stopped),
                workers: RwLock::new(Vec::new()),
                next_worker: AtomicU64::new(1),
                cursor: AtomicUsize::new(0),
                outstanding: DashSet::new(),
                ready_changed: Notify::new(),
                health_loop: Mutex::new(None),
                crashes: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn lifecycle(&self) -> PoolLifecycle {
        *self.inner.lifecycle.read()
    }

    pub fn desired_size(&self) -> usize {
        self.inner.desired_size.load(Ordering::SeqCst)
    }

    /// Current worker handles in startup order
    pub fn workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.workers.read().clone()
    }

    pub fn ready_count(&self) -> usize {
        self.inner
            .workers
            .read()
            .iter()
            .filter(|w| w.is_ready())
            .count()
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            lifecycle: self.lifecycle(),
            desired_size: self.desired_size(),
            crashes: self.inner.crashes.load(Ordering::SeqCst),
            workers: self.workers().iter().map(|w| w.snapshot()).collect(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawn `size` workers and wait until every one is READY
    #[instrument(skip(self))]
    pub async fn start(&self, size: usize) -> Result<(), PoolError> {
        {
            let mut lifecycle = self.inner.lifecycle.write();
            if *lifecycle != PoolLifecycle::Stopped {
                return Err(PoolError::AlreadyRunning);
            }
            *lifecycle = PoolLifecycle::Starting;
        }
        self.inner.desired_size.store(size, Ordering::SeqCst);

        let config = &self.inner.config;
        info!(
            size,
            program = %config.worker_program.display(),
            test_mode = config.test_mode,
            sandbox = %config.sandbox.mode,
            "Starting worker pool"
        );

        if let Err(e) = std::fs::create_dir_all(&config.socket_dir) {
            self.transition_lifecycle(PoolLifecycle::Starting, PoolLifecycle::Stopped);
            return Err(PoolError::PoolInitialization(format!(
                "cannot create socket directory {}: {}",
                config.socket_dir.display(),
                e
            )));
        }

        let mut failures = Vec::new();
        for attempt in 1..=config.startup_retries.max(1) {
            failures = self.replenish().await;
            if failures.is_empty() {
                break;
            }
            warn!(
                attempt,
                failed = failures.len(),
                error = %failures[0],
                "Workers failed to start, retrying"
            );
        }

        let ready = self.ready_count();
        if !failures.is_empty() || ready < size {
            let reason = failures
                .first()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "workers did not become ready".to_string());
            error!(ready, size, reason = %reason, "Worker pool failed to start");

            let workers = self.workers();
            join_all(workers.iter().map(|w| self.drain_worker(w, Instant::now()))).await;
            self.inner.workers.write().clear();
            // A concurrent shutdown owns the lifecycle from here
            self.transition_lifecycle(PoolLifecycle::Starting, PoolLifecycle::Stopped);

            return Err(PoolError::PoolInitialization(format!(
                "{} of {} workers ready after {} attempt(s): {}",
                ready, size, config.startup_retries, reason
            )));
        }

        {
            let mut lifecycle = self.inner.lifecycle.write();
            if *lifecycle != PoolLifecycle::Starting {
                warn!(lifecycle = %*lifecycle, "Pool shut down while starting");
                return Err(PoolError::ShuttingDown);
            }
            *lifecycle = PoolLifecycle::Running;
            // Spawned under the lock so shutdown always finds the loop to stop
            self.spawn_health_loop();
        }
        self.inner.ready_changed.notify_waiters();
        info!(size, "Worker pool running");
        Ok(())
    }

    /// Drain every worker, wait up to `grace_period`, then kill stragglers
    #[instrument(skip(self), fields(grace_ms = grace_period.as_millis() as u64))]
    pub async fn shutdown(&self, grace_period: Duration) -> Result<(), PoolError> {
        {
            let mut lifecycle = self.inner.lifecycle.write();
            match *lifecycle {
                PoolLifecycle::Stopped => return Ok(()),
                PoolLifecycle::Draining => return Err(PoolError::ShuttingDown),
                PoolLifecycle::Starting | PoolLifecycle::Running => {}
            }
            *lifecycle = PoolLifecycle::Draining;
        }
        // Waiters for a READY worker give up now
        self.inner.ready_changed.notify_waiters();
        self.stop_health_loop().await;

        let workers = self.workers();
        info!(workers = workers.len(), "Draining worker pool");

        let deadline = Instant::now() + grace_period;
        let exits = join_all(workers.iter().map(|w| self.drain_worker(w, deadline))).await;
        let forced = exits.iter().filter(|e| **e == Exit::Forced).count();

        self.inner.workers.write().clear();
        self.set_lifecycle(PoolLifecycle::Stopped);

        if forced > 0 {
            warn!(forced, "Worker pool stopped, some workers had to be killed");
        } else {
            info!("Worker pool stopped");
        }
        Ok(())
    }

    /// Grow or shrink the pool. Shrinking drains the newest workers first.
    #[instrument(skip(self))]
    pub async fn resize(&self, new_size: usize) -> Result<(), PoolError> {
        match self.lifecycle() {
            PoolLifecycle::Running => {}
            PoolLifecycle::Draining => return Err(PoolError::ShuttingDown),
            _ => return Err(PoolError::NotRunning),
        }

        let previous = self.inner.desired_size.swap(new_size, Ordering::SeqCst);
        info!(previous, new_size, "Resizing worker pool");

        let surplus: Vec<Arc<WorkerHandle>> = {
            let workers = self.inner.workers.read();
            let live: Vec<_> = workers
                .iter()
                .filter(|w| w.state().is_live())
                .cloned()
                .collect();
            let excess = live.len().saturating_sub(new_size);
            live.into_iter().rev().take(excess).collect()
        };

        if !surplus.is_empty() {
            // Out of rotation before anything else can pick them
            for worker in &surplus {
                worker.transition(WorkerState::Draining);
            }
            let deadline = Instant::now() + self.inner.config.shutdown_grace_period;
            join_all(surplus.iter().map(|w| self.drain_worker(w, deadline))).await;
            for worker in &surplus {
                self.remove_worker(worker);
            }
        }

        let failures = self.replenish().await;
        if let Some(first) = failures.first() {
            return Err(PoolError::PoolInitialization(format!(
                "{} new worker(s) failed to start: {}",
                failures.len(),
                first
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Run one request on some READY worker.
    ///
    /// Action failures and sandbox violations come back as an error result.
    /// `Err` means no worker could produce a result at all.
    #[instrument(skip_all, fields(request_id = %request.request_id, action = %request.action_name))]
    pub async fn submit(
        &self,
        mut request: ExecutionRequest,
    ) -> Result<ExecutionResult, PoolError> {
        match self.lifecycle() {
            PoolLifecycle::Running => {}
            PoolLifecycle::Draining => return Err(PoolError::ShuttingDown),
            PoolLifecycle::Stopped | PoolLifecycle::Starting => return Err(PoolError::NotRunning),
        }

        let request_id = request.request_id;
        if !self.inner.outstanding.insert(request_id) {
            return Err(PoolError::DuplicateRequestId(request_id));
        }
        let _outstanding = Outstanding {
            set: &self.inner.outstanding,
            request_id,
        };

        if request.deadline.is_zero() {
            request.deadline = self.inner.config.default_deadline;
        }

        let max_attempts = self.inner.config.max_attempts();
        let mut tried: Vec<String> = Vec::new();
        let mut last_fault: Option<String> = None;

        for attempt in 1..=max_attempts {
            let delay = self.inner.config.retry_backoff.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let Some(worker) = self.acquire_worker(&tried).await else {
                last_fault.get_or_insert_with(|| "no READY worker available".to_string());
                break;
            };

            match self.dispatch(&worker, &request, attempt).await {
                Ok(result) => {
                    debug!(
                        worker_id = %worker.id(),
                        attempt,
                        status = ?result.status,
                        "Request completed"
                    );
                    return Ok(result);
                }
                Err(fault) => {
                    warn!(
                        worker_id = %worker.id(),
                        attempt,
                        max_attempts,
                        error = %fault,
                        "Dispatch attempt failed"
                    );
                    if fault.is_fatal_to_worker() {
                        self.spawn_crash_handler(&worker, fault.to_string());
                    }
                    tried.push(worker.id().to_string());
                    last_fault = Some(fault.to_string());
                }
            }
        }

        let reason = last_fault.unwrap_or_else(|| "no attempt was made".to_string());
        error!(attempts = tried.len(), reason = %reason, "Request failed on every attempt");
        Err(PoolError::WorkerUnavailable {
            request_id,
            attempts: tried.len() as u32,
            reason,
        })
    }

    async fn dispatch(
        &self,
        worker: &Arc<WorkerHandle>,
        request: &ExecutionRequest,
        attempt: u32,
    ) -> Result<ExecutionResult, DispatchError> {
        let connection = worker
            .connection()
            .ok_or_else(|| DispatchError::WorkerCrash("worker has no connection".to_string()))?;
        let _in_flight = worker.begin_request();
        let deadline = request.deadline;

        // Tagged so a late answer to an earlier attempt on this worker is dropped
        let sent = request.clone().with_attempt(attempt);

        match tokio::time::timeout(deadline, connection.execute(sent)).await {
            Err(_) => Err(DispatchError::Timeout(deadline)),
            Ok(Err(fault)) => Err(fault),
            // The worker gave up at the same deadline we did
            Ok(Ok(result)) if result.error_kind() == Some(ErrorKind::TimeoutError) => {
                Err(DispatchError::Timeout(deadline))
            }
            Ok(Ok(result)) => Ok(result),
        }
    }

    /// A READY worker not in `exclude`, waiting for one to appear if needed.
    ///
    /// Falls back to an already-tried worker when nothing new is starting.
    async fn acquire_worker(&self, exclude: &[String]) -> Option<Arc<WorkerHandle>> {
        let deadline = Instant::now() + self.inner.config.startup_timeout;

        loop {
            // Registered before inspecting state so a wakeup cannot be missed
            let notified = self.inner.ready_changed.notified();
            if self.lifecycle() != PoolLifecycle::Running {
                return None;
            }

            let (fresh, fallback, starting) = {
                let workers = self.inner.workers.read();
                let usable: Vec<&Arc<WorkerHandle>> = workers
                    .iter()
                    .filter(|w| w.is_ready())
                    .filter(|w| w.connection().is_some_and(|c| !c.is_closed()))
                    .collect();
                let untried: Vec<&Arc<WorkerHandle>> = usable
                    .iter()
                    .copied()
                    .filter(|w| !exclude.iter().any(|id| id == w.id()))
                    .collect();
                let starting = workers.iter().any(|w| w.state() == WorkerState::Starting);
                (self.least_loaded(&untried), self.least_loaded(&usable), starting)
            };

            if fresh.is_some() {
                return fresh;
            }
            if !starting && fallback.is_some() {
                return fallback;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return fallback;
            }
        }
    }

    fn least_loaded(&self, candidates: &[&Arc<WorkerHandle>]) -> Option<Arc<WorkerHandle>> {
        if candidates.is_empty() {
            return None;
        }
        let offset = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        let n = candidates.len();
        (0..n)
            .map(|i| candidates[(offset + i) % n])
            .min_by_key(|w| w.in_flight())
            .cloned()
    }

    // =========================================================================
    // Worker processes
    // =========================================================================

    /// Launch workers until the live count reaches the desired size, then
    /// wait for them. Returns the failures; failed workers are discarded.
    async fn replenish(&self) -> Vec<PoolError> {
        let mut failures = Vec::new();
        let mut launched = Vec::new();
        for outcome in self.launch_missing() {
            match outcome {
                Ok(handle) => launched.push(handle),
                Err(e) => failures.push(e),
            }
        }
        if launched.is_empty() {
            return failures;
        }

        let outcomes = join_all(launched.iter().map(|h| self.await_ready(h))).await;
        for (handle, outcome) in launched.iter().zip(outcomes) {
            if let Err(e) = outcome {
                warn!(worker_id = %handle.id(), error = %e, "Worker failed to start");
                self.discard(handle).await;
                failures.push(e);
            }
        }
        failures
    }

    fn launch_missing(&self) -> Vec<Result<Arc<WorkerHandle>, PoolError>> {
        let mut workers = self.inner.workers.write();
        // Checked under the table lock so shutdown never misses a new worker
        if !matches!(
            self.lifecycle(),
            PoolLifecycle::Starting | PoolLifecycle::Running
        ) {
            return Vec::new();
        }

        let live = workers.iter().filter(|w| w.state().is_live()).count();
        let missing = self.desired_size().saturating_sub(live);

        let mut outcomes = Vec::with_capacity(missing);
        for _ in 0..missing {
            let outcome = self.launch().map(Arc::new);
            if let Ok(handle) = &outcome {
                workers.push(Arc::clone(handle));
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    fn launch(&self) -> Result<WorkerHandle, PoolError> {
        let config = &self.inner.config;
        let worker_id = format!(
            "worker-{}",
            self.inner.next_worker.fetch_add(1, Ordering::SeqCst)
        );
        let socket_path = config
            .socket_dir
            .join(format!("warmpool-{}-{}.sock", self.inner.pool_tag, worker_id));
        let worker_config = config.worker_config(&worker_id, &socket_path);

        let child = Command::new(&config.worker_program)
            .args(worker_args(&worker_config))
            // Held open for the worker's lifetime; EOF tells it we are gone
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PoolError::Spawn {
                worker_id: worker_id.clone(),
                source,
            })?;

        info!(
            worker_id = %worker_id,
            pid = child.id(),
            socket = %socket_path.display(),
            "Launched worker"
        );
        Ok(WorkerHandle::new(worker_id, socket_path, child))
    }

    /// STARTING -> READY once the listener answers a ping
    async fn await_ready(&self, handle: &Arc<WorkerHandle>) -> Result<(), PoolError> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.startup_timeout;
        let codec = FrameCodec::new().with_max_frame_len(config.max_frame_len);

        loop {
            if handle.state() != WorkerState::Starting {
                return Err(PoolError::PoolInitialization(format!(
                    "worker {} left STARTING before it was ready",
                    handle.id()
                )));
            }
            if let Some(status) = handle.exit_status() {
                return Err(PoolError::PoolInitialization(format!(
                    "worker {} exited during startup ({})",
                    handle.id(),
                    status
                )));
            }
            if Instant::now() >= deadline {
                return Err(PoolError::PoolInitialization(format!(
                    "worker {} not ready within {:?}",
                    handle.id(),
                    config.startup_timeout
                )));
            }

            if let Ok(stream) = UnixStream::connect(handle.socket_path()).await {
                let connection = Arc::new(WorkerConnection::open(handle.id(), stream, codec));
                match connection.ping(config.health_check_timeout).await {
                    Ok(_) => {
                        handle.attach(connection);
                        handle.record_heartbeat();
                        if !handle.transition_from(WorkerState::Starting, WorkerState::Ready) {
                            continue;
                        }
                        info!(worker_id = %handle.id(), pid = handle.pid(), "Worker ready");
                        self.inner.ready_changed.notify_waiters();
                        return Ok(());
                    }
                    Err(e) => {
                        debug!(worker_id = %handle.id(), error = %e, "Startup ping failed");
                        connection.close();
                    }
                }
            }

            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    /// Throw away a worker that never became READY
    async fn discard(&self, handle: &Arc<WorkerHandle>) {
        handle.transition(WorkerState::Crashed);
        if let Some(connection) = handle.connection() {
            connection.close();
        }
        handle.kill().await;
        handle.transition(WorkerState::Terminated);
        handle.remove_socket();
        self.remove_worker(handle);
    }

    /// DRAINING -> SIGTERM -> wait until `deadline` -> kill -> TERMINATED
    async fn drain_worker(&self, worker: &Arc<WorkerHandle>, deadline: Instant) -> Exit {
        worker.transition(WorkerState::Draining);
        if !worker.signal_terminate() {
            debug!(worker_id = %worker.id(), "Termination signal not delivered");
        }

        let exit = worker
            .reap(deadline.saturating_duration_since(Instant::now()))
            .await;

        // In-flight results were read before the worker's side closed
        if let Some(connection) = worker.connection() {
            connection.close();
        }
        worker.transition(WorkerState::Terminated);
        worker.remove_socket();
        info!(worker_id = %worker.id(), ?exit, "Worker terminated");
        exit
    }

    /// READY -> CRASHED -> kill and reap -> TERMINATED, then restore the pool size
    async fn handle_crash(&self, worker: &Arc<WorkerHandle>, reason: String) {
        if !worker.transition_from(WorkerState::Ready, WorkerState::Crashed) {
            return;
        }
        self.inner.crashes.fetch_add(1, Ordering::SeqCst);
        error!(
            worker_id = %worker.id(),
            pid = worker.pid(),
            in_flight = worker.in_flight(),
            reason = %reason,
            "Worker crashed, replacing"
        );

        // Fails every request still waiting on this worker so it can retry
        if let Some(connection) = worker.connection() {
            connection.close();
        }
        worker.kill().await;
        worker.transition(WorkerState::Terminated);
        worker.remove_socket();
        self.remove_worker(worker);

        for failure in self.replenish().await {
            warn!(error = %failure, "Replacement worker failed to start");
        }
    }

    fn spawn_crash_handler(&self, worker: &Arc<WorkerHandle>, reason: String) {
        let manager = self.clone();
        let worker = Arc::clone(worker);
        tokio::spawn(async move { manager.handle_crash(&worker, reason).await });
    }

    fn remove_worker(&self, worker: &Arc<WorkerHandle>) {
        self.inner
            .workers
            .write()
            .retain(|w| !Arc::ptr_eq(w, worker));
    }

    fn set_lifecycle(&self, lifecycle: PoolLifecycle) {
        *self.inner.lifecycle.write() = lifecycle;
    }

    /// Move `from -> to` only if the pool is still in `from`
    fn transition_lifecycle(&self, from: PoolLifecycle, to: PoolLifecycle) -> bool {
        let mut lifecycle = self.inner.lifecycle.write();
        if *lifecycle != from {
            return false;
        }
        *lifecycle = to;
        true
    }

    // =========================================================================
    // Health checks
    // =========================================================================

    fn spawn_health_loop(&self) {
        let token = CancellationToken::new();
        let interval = self.inner.config.health_check_interval;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let cancelled = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; every worker was just pinged
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                // Stop once every PoolManager clone has been dropped
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = PoolManager { inner };
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = manager.health_check() => {}
                }
            }
            debug!("Health-check loop exited");
        });

        *self.inner.health_loop.lock() = Some((token, handle));
    }

    async fn stop_health_loop(&self) {
        let running = self.inner.health_loop.lock().take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "Health-check loop ended abnormally");
            }
        }
    }

    async fn health_check(&self) {
        let ready: Vec<Arc<WorkerHandle>> = self
            .inner
            .workers
            .read()
            .iter()
            .filter(|w| w.is_ready())
            .cloned()
            .collect();

        join_all(ready.iter().map(|w| self.check_worker(w))).await;

        for failure in self.replenish().await {
            warn!(error = %failure, "Replacement worker failed to start");
        }
    }

    async fn check_worker(&self, worker: &Arc<WorkerHandle>) {
        if let Some(status) = worker.exit_status() {
            self.handle_crash(worker, format!("process exited ({})", status))
                .await;
            return;
        }
        let Some(connection) = worker.connection() else {
            self.handle_crash(worker, "no connection".to_string()).await;
            return;
        };

        match connection.ping(self.inner.config.health_check_timeout).await {
            Ok(remote_in_flight) => {
                worker.record_heartbeat();
                debug!(worker_id = %worker.id(), remote_in_flight, "Health check passed");
            }
            Err(fault) if fault.is_fatal_to_worker() => {
                self.handle_crash(worker, fault.to_string()).await;
            }
            Err(fault) => {
                let missed = worker.record_missed_health_check();
                warn!(worker_id = %worker.id(), missed, error = %fault, "Health check missed");
                if missed >= self.inner.config.max_missed_health_checks {
                    self.handle_crash(
                        worker,
                        format!("missed {} consecutive health checks", missed),
                    )
                    .await;
                }
            }
        }
    }
}

/// Frees a request id once its submission finishes
struct Outstanding<'a> {
    set: &'a DashSet<Uuid>,
    request_id: Uuid,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submit_before_start() {
        let pool = PoolManager::new(PoolConfig::default());
        let err = pool
            .submit(ExecutionRequest::new("testing.add_100"))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NotRunning));
    }

    #[tokio::test]
    async fn test_shutdown_when_stopped_is_noop() {
        let pool = PoolManager::new(PoolConfig::default());
        pool.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.lifecycle(), PoolLifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_resize_requires_running_pool() {
        let pool = PoolManager::new(PoolConfig::default());
        assert!(matches!(pool.resize(2).await, Err(PoolError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_with_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pool = PoolManager::new(
            PoolConfig::default()
                .with_worker_program(dir.path().join("no-such-worker"))
                .with_socket_dir(dir.path())
                .with_startup_retries(2),
        );

        let err = pool.start(2).await.unwrap_err();
        assert!(matches!(err, PoolError::PoolInitialization(_)));
        assert_eq!(pool.lifecycle(), PoolLifecycle::Stopped);
        assert!(pool.workers().is_empty());
    }

    #[test]
    fn test_empty_status() {
        let pool = PoolManager::new(PoolConfig::default().with_size(3));
        let status = pool.status();
        assert_eq!(status.lifecycle, PoolLifecycle::Stopped);
        assert_eq!(status.desired_size, 3);
        assert_eq!(status.ready_count(), 0);
        assert_eq!(status.crashes, 0);
    }

    #[test]
    fn test_lifecycle_display() {
        assert_eq!(PoolLifecycle::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&PoolLifecycle::Draining).unwrap(),
            "\"draining\""
        );
    }
}
