//! Worker server
//!
//! Accepts connections from the pool manager on a local socket and serves
//! framed requests. Each execute frame runs in its own task, so a slow action
//! never blocks reading the next frame, and results are written back in
//! completion order through a single writer task per connection.
//!
//! On shutdown the server stops accepting, stops reading new frames, and
//! gives in-flight work up to the configured grace period before exiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn, Instrument};

use warmpool_protocol::{
    ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult, Frame, FrameCodec, ProtocolError,
};

use crate::config::WorkerConfig;
use crate::error::ServerError;
use crate::executor::ActionExecutor;

/// Completed results buffered per connection before executing tasks wait
const RESPONSE_QUEUE_DEPTH: usize = 256;

/// Payload returned for every request when the worker runs in test mode
pub fn test_mode_payload() -> serde_json::Value {
    json!({ "test_mode": true })
}

pub struct WorkerServer {
    config: WorkerConfig,
    executor: Arc<ActionExecutor>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    limiter: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkerServer {
    pub fn new(config: WorkerConfig, executor: ActionExecutor) -> Self {
        let limiter = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            executor: Arc::new(executor),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            limiter,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Token that, once cancelled, starts a graceful drain
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Requests accepted but not yet answered
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Bind the configured socket, replacing a stale file from a previous run
    pub fn bind(&self) -> Result<UnixListener, ServerError> {
        let path = &self.config.socket_path;
        if path.exists() {
            std::fs::remove_file(path).map_err(|source| ServerError::Bind {
                path: path.clone(),
                source,
            })?;
        }
        UnixListener::bind(path).map_err(|source| ServerError::Bind {
            path: path.clone(),
            source,
        })
    }

    pub async fn run(&self) -> Result<(), ServerError> {
        self.config.validate()?;
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Serve until the shutdown token fires, then drain
    pub async fn serve(&self, listener: UnixListener) {
        info!(
            worker_id = %self.config.worker_id,
            socket = %self.config.socket_path.display(),
            test_mode = self.config.test_mode,
            sandbox = %self.executor.policy().mode(),
            "Worker listening"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!(worker_id = %self.config.worker_id, "Manager connected");
                        let connection = self.connection();
                        self.tracker.spawn(connection.serve(stream).in_current_span());
                    }
                    Err(e) => {
                        warn!(worker_id = %self.config.worker_id, error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        drop(listener);
        let _ = std::fs::remove_file(&self.config.socket_path);
        self.drain().await;
    }

    async fn drain(&self) {
        self.tracker.close();
        let grace = self.config.shutdown_grace;
        info!(
            worker_id = %self.config.worker_id,
            in_flight = self.in_flight(),
            grace_ms = grace.as_millis() as u64,
            "Worker draining"
        );

        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                worker_id = %self.config.worker_id,
                abandoned = self.in_flight(),
                "Grace period elapsed with requests still running"
            );
        }
        info!(worker_id = %self.config.worker_id, "Worker stopped");
    }

    fn connection(&self) -> Connection {
        Connection {
            executor: Arc::clone(&self.executor),
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
            limiter: Arc::clone(&self.limiter),
            in_flight: Arc::clone(&self.in_flight),
            codec: FrameCodec::new().with_max_frame_len(self.config.max_frame_len),
            test_mode: self.config.test_mode,
        }
    }
}

/// State shared by the reader side of one manager connection
struct Connection {
    executor: Arc<ActionExecutor>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    limiter: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    codec: FrameCodec,
    test_mode: bool,
}

impl Connection {
    async fn serve(self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let mut frames = FramedRead::new(read_half, self.codec);
        let sink = FramedWrite::new(write_half, self.codec);

        let (tx, rx) = mpsc::channel(RESPONSE_QUEUE_DEPTH);
        let closed = CancellationToken::new();
        self.tracker
            .spawn(write_frames(sink, rx, closed.clone()).in_current_span());

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Stopped reading new requests");
                    break;
                }
                next = frames.next() => next,
            };

            match next {
                None => {
                    debug!("Manager closed connection");
                    closed.cancel();
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Protocol error, closing connection");
                    closed.cancel();
                    break;
                }
                Some(Ok(Frame::Execute(request))) => self.dispatch(request, tx.clone()),
                Some(Ok(Frame::Ping { nonce })) => {
                    let pong = Frame::Pong {
                        nonce,
                        in_flight: self.in_flight.load(Ordering::SeqCst),
                    };
                    if tx.send(pong).await.is_err() {
                        break;
                    }
                }
                Some(Ok(other)) => {
                    warn!(frame = frame_kind(&other), "Unexpected frame, closing connection");
                    closed.cancel();
                    break;
                }
            }
        }
        // The writer exits once every task holding a sender has reported
    }

    fn dispatch(&self, request: ExecutionRequest, tx: mpsc::Sender<Frame>) {
        let executor = Arc::clone(&self.executor);
        let limiter = Arc::clone(&self.limiter);
        let test_mode = self.test_mode;
        let in_flight = InFlight::enter(&self.in_flight);

        self.tracker.spawn(
            async move {
                let _in_flight = in_flight;
                let request_id = request.request_id;
                let attempt = request.attempt;
                let action = request.action_name.clone();

                let result = if test_mode {
                    ExecutionResult::success(request_id, test_mode_payload(), Duration::ZERO)
                } else {
                    let Ok(_permit) = limiter.acquire_owned().await else {
                        return;
                    };
                    executor.execute(request).await
                }
                .with_attempt(attempt);

                debug!(
                    %request_id,
                    action = %action,
                    status = ?result.status,
                    duration_ms = result.duration.as_millis() as u64,
                    "Request finished"
                );
                if tx.send(Frame::Result(result)).await.is_err() {
                    debug!(%request_id, "Connection closed before the result was sent");
                }
            }
            .in_current_span(),
        );
    }
}

async fn write_frames(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let answered = match &frame {
            Frame::Result(result) => Some((result.request_id, result.attempt, result.duration)),
            _ => None,
        };

        match sink.send(frame).await {
            Ok(()) => {}
            Err(ProtocolError::FrameTooLarge { len, max }) => {
                // Nothing was written; answer with an error in place of the oversized result
                let Some((request_id, attempt, duration)) = answered else {
                    break;
                };
                warn!(%request_id, len, max, "Result exceeds frame limit");
                let replacement = ExecutionResult::failure(
                    request_id,
                    ExecutionError::new(
                        ErrorKind::ActionExecutionError,
                        format!("result of {} bytes exceeds the {} byte frame limit", len, max),
                    ),
                    duration,
                )
                .with_attempt(attempt);
                if let Err(e) = sink.send(Frame::Result(replacement)).await {
                    warn!(error = %e, "Failed to write frame");
                    break;
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to write frame");
                break;
            }
        }
    }
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Execute(_) => "execute",
        Frame::Result(_) => "result",
        Frame::Ping { .. } => "ping",
        Frame::Pong { .. } => "pong",
    }
}

/// Counts a request as in flight until dropped
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
