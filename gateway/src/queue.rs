use crate::metrics::GatewayMetrics;
use crate::principal::Principal;
use bytes::Bytes;
use common_http_errors::ApiError;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Capacity of a single streaming Job's chunk channel. Bounded so a slow
/// client backpressures the Dispatcher instead of letting chunks pile up
/// unboundedly in memory.
const STREAM_CHUNK_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Unary,
    Stream,
}

/// An upstream failure converted to a dispatchable result, never a panic or
/// an `Err` bubbled out of the Dispatcher loop itself.
#[derive(Debug, Clone)]
pub struct JobError {
    pub status_code: u16,
    pub message: String,
}

impl JobError {
    pub fn into_api_error(self) -> ApiError {
        match self.status_code {
            404 => ApiError::NotFound { code: "unsupported_endpoint", trace_id: None },
            502 => ApiError::BadGateway { trace_id: None, message: Some(self.message) },
            status => ApiError::Upstream { status, trace_id: None, message: Some(self.message) },
        }
    }
}

pub type JobOutcome = Result<Value, JobError>;

/// A unit of admitted work. Created by the Admission Front, handed to the
/// Queue, owned by the Dispatcher until its result/chunk channel closes.
pub struct Job {
    pub endpoint: String,
    pub body: Value,
    pub principal: Principal,
    pub mode: JobMode,
    pub result_tx: Option<oneshot::Sender<JobOutcome>>,
    pub chunk_tx: Option<mpsc::Sender<Bytes>>,
}

impl Job {
    pub fn new_unary(
        endpoint: impl Into<String>,
        body: Value,
        principal: Principal,
    ) -> (Self, oneshot::Receiver<JobOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                endpoint: endpoint.into(),
                body,
                principal,
                mode: JobMode::Unary,
                result_tx: Some(tx),
                chunk_tx: None,
            },
            rx,
        )
    }

    pub fn new_stream(
        endpoint: impl Into<String>,
        body: Value,
        principal: Principal,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(STREAM_CHUNK_BUFFER);
        (
            Self {
                endpoint: endpoint.into(),
                body,
                principal,
                mode: JobMode::Stream,
                result_tx: None,
                chunk_tx: Some(tx),
            },
            rx,
        )
    }

    /// Fulfils a unary job's result slot. A dropped receiver (admission
    /// front gave up after a timeout) is not an error here.
    pub fn complete(&mut self, outcome: JobOutcome) {
        if let Some(tx) = self.result_tx.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Bounded FIFO admission queue. `offer` never blocks: a full queue is
/// immediate backpressure, never a wait. `depth` is a plain counter shared
/// with the [`JobReceiver`] side so `gateway_queue_depth` reflects admitted-
/// but-not-yet-dequeued jobs on both ends of the channel.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    depth: Arc<AtomicI64>,
    metrics: Arc<GatewayMetrics>,
}

pub struct JobReceiver {
    rx: mpsc::Receiver<Job>,
    depth: Arc<AtomicI64>,
    metrics: Arc<GatewayMetrics>,
}

impl JobQueue {
    pub fn bounded(capacity: usize, metrics: Arc<GatewayMetrics>) -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        let depth = Arc::new(AtomicI64::new(0));
        (
            Self { tx, depth: depth.clone(), metrics: metrics.clone() },
            JobReceiver { rx, depth, metrics },
        )
    }

    /// Attempts to admit a job without waiting. Returns `ServiceUnavailable`
    /// immediately if the queue is at capacity.
    pub fn offer(&self, job: Job) -> Result<(), ApiError> {
        match self.tx.try_send(job) {
            Ok(()) => {
                let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
                self.metrics.set_queue_depth(depth.max(0) as usize);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(ApiError::ServiceUnavailable {
                trace_id: None,
                message: Some("job queue is full".into()),
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ApiError::ServiceUnavailable {
                trace_id: None,
                message: Some("dispatcher is not accepting work".into()),
            }),
        }
    }
}

impl JobReceiver {
    /// Dequeues the next job, decrementing the shared depth gauge. Mirrors
    /// `mpsc::Receiver::recv`'s semantics: `None` once the sender side is
    /// dropped and the channel has drained.
    pub async fn recv(&mut self) -> Option<Job> {
        let job = self.rx.recv().await;
        if job.is_some() {
            let depth = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
            self.metrics.set_queue_depth(depth.max(0) as usize);
        }
        job
    }
}
