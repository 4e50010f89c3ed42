use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::metrics::GatewayMetrics;
use crate::queue::{Job, JobError, JobMode, JobReceiver};
use crate::upstream::{StreamOutcome, UpstreamClient};

/// Single worker that drains the [`crate::queue::JobQueue`], bounded by a
/// [`Semaphore`] of size `vllm_max_concurrency`. Mirrors
/// `original_source/gateway/app/queue.py::_dispatcher` structurally: a
/// 200ms-polled dequeue loop so shutdown is observed promptly, one semaphore
/// permit held for the duration of the upstream call.
pub struct Dispatcher {
    receiver: JobReceiver,
    upstream: UpstreamClient,
    semaphore: Arc<Semaphore>,
    capacity: usize,
    metrics: Arc<GatewayMetrics>,
    shutdown: Arc<AtomicBool>,
}

/// Returned by [`Dispatcher::spawn`]; used by lifecycle management to signal
/// and await shutdown.
pub struct DispatcherHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Sets the cooperative shutdown flag and waits up to 5 seconds for the
    /// worker to drain in-flight work before forcefully aborting it.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        match timeout(Duration::from_secs(5), self.join).await {
            Ok(Ok(())) => info!("dispatcher drained and exited"),
            Ok(Err(err)) => warn!(?err, "dispatcher task panicked during shutdown"),
            Err(_) => warn!("dispatcher did not exit within 5s, aborting"),
        }
    }
}

impl Dispatcher {
    pub fn new(
        receiver: JobReceiver,
        upstream: UpstreamClient,
        max_concurrency: usize,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            receiver,
            upstream,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            capacity: max_concurrency,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Starts the background worker loop, returning a handle used to request
    /// shutdown.
    pub fn spawn(self) -> DispatcherHandle {
        let shutdown = self.shutdown.clone();
        let join = tokio::spawn(self.run());
        DispatcherHandle { shutdown, join }
    }

    /// Dequeue loop. Acquiring the semaphore permit happens here, in FIFO
    /// dequeue order, so job A always acquires before job B per the FIFO
    /// admission invariant; the upstream call itself runs on its own spawned
    /// task so up to `vllm_max_concurrency` calls are genuinely concurrent
    /// rather than serialized behind one worker.
    async fn run(mut self) {
        let upstream = Arc::new(self.upstream.clone());
        while !self.shutdown.load(Ordering::SeqCst) {
            let job = match timeout(Duration::from_millis(200), self.receiver.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => break, // queue sender dropped; nothing left to serve
                Err(_) => continue, // poll timeout; re-check shutdown
            };

            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed, worker is shutting down
            };
            self.metrics
                .set_dispatcher_in_flight((self.capacity - self.semaphore.available_permits()) as i64);

            let upstream = upstream.clone();
            let metrics = self.metrics.clone();
            let semaphore = self.semaphore.clone();
            let capacity = self.capacity;
            tokio::spawn(async move {
                dispatch_one(&upstream, &metrics, job).await;
                drop(permit);
                metrics.set_dispatcher_in_flight((capacity - semaphore.available_permits()) as i64);
            });
        }
    }
}

async fn dispatch_one(upstream: &UpstreamClient, metrics: &GatewayMetrics, mut job: Job) {
    match job.endpoint.as_str() {
        "/v1/chat/completions" => match job.mode {
            JobMode::Stream => dispatch_stream(upstream, metrics, &mut job).await,
            JobMode::Unary => dispatch_unary(upstream, metrics, &mut job).await,
        },
        _ => job.complete(Err(JobError {
            status_code: 404,
            message: "unsupported endpoint".into(),
        })),
    }
}

async fn dispatch_unary(upstream: &UpstreamClient, metrics: &GatewayMetrics, job: &mut Job) {
    let started = std::time::Instant::now();
    let outcome = upstream.chat_completions(job.body.clone()).await;
    metrics.observe_upstream_latency(started.elapsed().as_secs_f64());
    match outcome {
        Ok(value) => job.complete(Ok(value)),
        Err(err) => job.complete(Err(err)),
    }
}

async fn dispatch_stream(upstream: &UpstreamClient, metrics: &GatewayMetrics, job: &mut Job) {
    let Some(chunk_tx) = job.chunk_tx.take() else { return };
    let started = std::time::Instant::now();
    let outcome = upstream.stream_chat_completions(job.body.clone()).await;
    metrics.observe_upstream_latency(started.elapsed().as_secs_f64());
    match outcome {
        StreamOutcome::Ok(mut stream) => {
            use futures::StreamExt;
            while let Some(next) = stream.next().await {
                match next {
                    Ok(bytes) => {
                        if chunk_tx.send(bytes).await.is_err() {
                            break; // client gone; stop pulling from upstream
                        }
                    }
                    Err(err) => {
                        let frame = crate::upstream::sse_error_frame(502, &err.to_string());
                        let _ = chunk_tx.send(frame).await;
                        break;
                    }
                }
            }
        }
        StreamOutcome::Error(frame) => {
            let _ = chunk_tx.send(frame).await;
        }
    }
    // chunk_tx drops here, closing the channel: the sentinel the
    // Admission Front's forwarding loop waits on.
}
