//! Manager side of a worker connection
//!
//! One connection per worker carries every request dispatched to it. Callers
//! register a oneshot keyed by `(request_id, attempt)`, the writer task
//! serializes frames onto the socket, and the reader task routes each result
//! to whoever is waiting for that attempt. Results arrive in completion order;
//! stream order means nothing. A result for an attempt nobody waits on any
//! more (it timed out and was retried) is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use warmpool_protocol::{
    ErrorKind, ExecutionError, ExecutionRequest, ExecutionResult, Frame, FrameCodec, ProtocolError,
};

use crate::error::DispatchError;

/// Frames queued for the writer before senders wait
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// One dispatch of one request
type AttemptKey = (Uuid, u32);

/// State shared between the connection and its reader/writer tasks
struct Shared {
    worker_id: String,
    pending: DashMap<AttemptKey, oneshot::Sender<ExecutionResult>>,
    pongs: DashMap<u64, oneshot::Sender<usize>>,
    closed: CancellationToken,
    close_reason: Mutex<Option<DispatchError>>,
}

impl Shared {
    /// Record why the connection died (first reason wins) and fail all waiters
    fn fail(&self, reason: DispatchError) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                debug!(worker_id = %self.worker_id, reason = %reason, "Worker connection closed");
                *slot = Some(reason);
            }
        }
        self.closed.cancel();
        // Dropping the senders wakes every waiter
        self.pending.clear();
        self.pongs.clear();
    }

    fn reason(&self) -> DispatchError {
        self.close_reason
            .lock()
            .clone()
            .unwrap_or_else(|| DispatchError::WorkerCrash("connection closed".to_string()))
    }
}

pub struct WorkerConnection {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    next_nonce: AtomicU64,
}

impl WorkerConnection {
    /// Take over a connected stream and start its reader and writer tasks
    pub fn open(worker_id: impl Into<String>, stream: UnixStream, codec: FrameCodec) -> Self {
        let shared = Arc::new(Shared {
            worker_id: worker_id.into(),
            pending: DashMap::new(),
            pongs: DashMap::new(),
            closed: CancellationToken::new(),
            close_reason: Mutex::new(None),
        });

        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        tokio::spawn(read_frames(
            FramedRead::new(read_half, codec),
            Arc::clone(&shared),
        ));
        tokio::spawn(write_frames(
            FramedWrite::new(write_half, codec),
            rx,
            Arc::clone(&shared),
        ));

        Self {
            shared,
            outbound,
            next_nonce: AtomicU64::new(1),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Requests sent and not yet answered
    pub fn pending(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn close(&self) {
        self.shared
            .fail(DispatchError::WorkerCrash("connection closed by manager".to_string()));
    }

    /// Send one request and wait for the result of this exact attempt. No
    /// deadline is applied here; dropping the future abandons the attempt and
    /// a late result for it is ignored.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, DispatchError> {
        if self.is_closed() {
            return Err(self.shared.reason());
        }

        let key = (request.request_id, request.attempt);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(key, tx);
        let _pending = PendingGuard {
            shared: &self.shared,
            key,
        };

        if self.outbound.send(Frame::Execute(request)).await.is_err() {
            return Err(self.shared.reason());
        }

        tokio::select! {
            biased;
            result = rx => result.map_err(|_| self.shared.reason()),
            _ = self.shared.closed.cancelled() => Err(self.shared.reason()),
        }
    }

    /// Health check; returns the worker's own in-flight count
    pub async fn ping(&self, timeout: Duration) -> Result<usize, DispatchError> {
        if self.is_closed() {
            return Err(self.shared.reason());
        }

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pongs.insert(nonce, tx);

        let exchange = async {
            if self.outbound.send(Frame::Ping { nonce }).await.is_err() {
                return Err(self.shared.reason());
            }
            rx.await.map_err(|_| self.shared.reason())
        };

        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DispatchError::Timeout(timeout)),
        };
        self.shared.pongs.remove(&nonce);
        outcome
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

/// Removes the pending entry if the caller stops waiting
struct PendingGuard<'a> {
    shared: &'a Shared,
    key: AttemptKey,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.key);
    }
}

async fn read_frames(mut frames: FramedRead<OwnedReadHalf, FrameCodec>, shared: Arc<Shared>) {
    loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => return,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(Frame::Result(result))) => {
                match shared.pending.remove(&(result.request_id, result.attempt)) {
                    Some((_, waiter)) => {
                        let _ = waiter.send(result);
                    }
                    None => debug!(
                        worker_id = %shared.worker_id,
                        request_id = %result.request_id,
                        attempt = result.attempt,
                        "Ignoring result nobody is waiting for"
                    ),
                }
            }
            Some(Ok(Frame::Pong { nonce, in_flight })) => {
                if let Some((_, waiter)) = shared.pongs.remove(&nonce) {
                    let _ = waiter.send(in_flight);
                }
            }
            Some(Ok(_)) => {
                warn!(worker_id = %shared.worker_id, "Worker sent a request-side frame");
                shared.fail(DispatchError::Protocol("unexpected frame from worker".to_string()));
                return;
            }
            Some(Err(ProtocolError::Io(e))) => {
                shared.fail(DispatchError::WorkerCrash(format!("transport error: {}", e)));
                return;
            }
            Some(Err(e)) => {
                warn!(
                    worker_id = %shared.worker_id,
                    error = %e,
                    "Protocol error on worker connection"
                );
                shared.fail(DispatchError::Protocol(e.to_string()));
                return;
            }
            None => {
                shared.fail(DispatchError::WorkerCrash(
                    "worker closed the connection".to_string(),
                ));
                return;
            }
        }
    }
}

async fn write_frames(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) {
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => return,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return,
            },
        };

        let key = match &frame {
            Frame::Execute(request) => Some((request.request_id, request.attempt)),
            _ => None,
        };

        match sink.send(frame).await {
            Ok(()) => {}
            Err(ProtocolError::FrameTooLarge { len, max }) => {
                // Nothing was written; only this request fails, and retrying cannot help
                warn!(worker_id = %shared.worker_id, len, max, "Request exceeds frame limit");
                if let Some(((request_id, attempt), waiter)) =
                    key.and_then(|key| shared.pending.remove(&key))
                {
                    let error = ExecutionError::new(
                        ErrorKind::ProtocolError,
                        format!("request of {} bytes exceeds the {} byte frame limit", len, max),
                    );
                    let _ = waiter.send(
                        ExecutionResult::failure(request_id, error, Duration::ZERO)
                            .with_attempt(attempt),
                    );
                }
            }
            Err(ProtocolError::Io(e)) => {
                shared.fail(DispatchError::WorkerCrash(format!("transport error: {}", e)));
                return;
            }
            Err(e) => {
                shared.fail(DispatchError::Protocol(e.to_string()));
                return;
            }
        }
    }
}
