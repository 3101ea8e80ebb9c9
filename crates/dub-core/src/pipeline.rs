//! Ingestion loop -> bounded task queue -> rate-limited worker pool.
//!
//! Shutdown order: the root token stops the ingestion loop, which closes the
//! queue by dropping its sender. Workers drain whatever is still queued, then
//! the limiter is cancelled and the pipeline reports `Stopped`.

use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use tokio::{
    sync::{mpsc, watch, Mutex},
    task::{JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::PipelineConfig,
    domain::Event,
    limiter::{TokenBucketLimiter, Tokens},
    ports::{EventSource, UpdateHandler},
    Result,
};

type TaskQueue = Arc<Mutex<mpsc::Receiver<Event>>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Polling and consuming.
    Running,
    /// Cancellation observed; workers are finishing queued tasks.
    Draining,
    /// Every worker exited. No handler is running and none will start.
    Stopped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Events pushed into the task queue.
    pub enqueued: u64,
    /// Handler invocations that returned (successfully or not).
    pub handled: u64,
    pub failed: u64,
    pub panicked: u64,
    /// Highest update id handed to the queue so far.
    pub cursor: u64,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    handled: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    cursor: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            handled: self.handled.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            panicked: self.panicked.load(Ordering::SeqCst),
            cursor: self.cursor.load(Ordering::SeqCst),
        }
    }
}

pub struct DispatchPipeline {
    cfg: PipelineConfig,
    limiter: TokenBucketLimiter,
    source: Arc<dyn EventSource>,
    handler: Arc<dyn UpdateHandler>,
}

impl DispatchPipeline {
    pub fn new(
        cfg: PipelineConfig,
        source: Arc<dyn EventSource>,
        handler: Arc<dyn UpdateHandler>,
    ) -> Result<Self> {
        cfg.validate()?;
        let limiter = TokenBucketLimiter::new(cfg.rate_limit_per_second)?;
        Ok(Self {
            cfg,
            limiter,
            source,
            handler,
        })
    }

    /// Spawn the ingestion loop, the workers and the token feeder. Returns immediately.
    pub fn start(self, cancel: CancellationToken) -> ShutdownHandle {
        let counters = Arc::new(Counters::default());
        let (phase_tx, phase_rx) = watch::channel(Phase::Running);

        let (tx, rx) = mpsc::channel::<Event>(self.cfg.queue_capacity);
        let queue: TaskQueue = Arc::new(Mutex::new(rx));

        // Owned by the pipeline: fires only after the workers are gone.
        let limiter_cancel = CancellationToken::new();
        let tokens = self.limiter.start(limiter_cancel);

        let mut workers = JoinSet::new();
        for worker in 0..self.cfg.worker_count {
            workers.spawn(worker_loop(
                worker,
                queue.clone(),
                tokens.clone(),
                self.handler.clone(),
                counters.clone(),
                cancel.clone(),
            ));
        }

        info!(
            workers = self.cfg.worker_count,
            queue_capacity = self.cfg.queue_capacity,
            rate_limit_per_second = self.cfg.rate_limit_per_second,
            "dispatch pipeline started"
        );

        let coordinator = {
            let counters = counters.clone();
            let source = self.source;
            let retry_delay = self.cfg.poll_retry_delay;
            tokio::spawn(async move {
                ingest(source, tx, cancel, counters.clone(), retry_delay).await;
                phase_tx.send_replace(Phase::Draining);
                info!("ingestion stopped, draining task queue");

                while let Some(res) = workers.join_next().await {
                    if let Err(e) = res {
                        error!(error = %e, "worker task failed");
                    }
                }
                tokens.shutdown().await;

                let stats = counters.snapshot();
                phase_tx.send_replace(Phase::Stopped);
                info!(
                    enqueued = stats.enqueued,
                    handled = stats.handled,
                    failed = stats.failed,
                    panicked = stats.panicked,
                    "dispatch pipeline stopped"
                );
            })
        };

        ShutdownHandle {
            phase: phase_rx,
            counters,
            coordinator,
        }
    }
}

/// Returned by [`DispatchPipeline::start`].
pub struct ShutdownHandle {
    phase: watch::Receiver<Phase>,
    counters: Arc<Counters>,
    coordinator: JoinHandle<()>,
}

impl ShutdownHandle {
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Block until the pipeline reaches [`Phase::Stopped`].
    pub async fn wait(self) -> PipelineStats {
        if let Err(e) = self.coordinator.await {
            error!(error = %e, "pipeline coordinator failed");
        }
        self.counters.snapshot()
    }
}

async fn ingest(
    source: Arc<dyn EventSource>,
    tasks: mpsc::Sender<Event>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
    retry_delay: Duration,
) {
    // Single writer. Only tells the source where to resume on the next poll.
    let mut last_update_id = 0u64;

    'poll: loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'poll,
            res = source.poll(last_update_id) => res,
        };

        let mut events = match batch {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, offset = last_update_id, "polling updates failed");
                tokio::select! {
                    _ = cancel.cancelled() => break 'poll,
                    _ = tokio::time::sleep(retry_delay) => continue 'poll,
                }
            }
        };
        events.sort_by_key(|e| e.update_id);

        for event in events {
            let update_id = event.update_id;

            // Blocks while the queue is full, which throttles polling.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(update_id, "cancelled while enqueueing; dropping rest of batch");
                    break 'poll;
                }
                res = tasks.send(event) => {
                    if res.is_err() {
                        warn!(update_id, "task queue closed unexpectedly");
                        break 'poll;
                    }
                    counters.enqueued.fetch_add(1, Ordering::SeqCst);
                }
            }

            // Handed off: the next poll resumes past it, whatever the handler does.
            last_update_id = last_update_id.max(update_id);
            counters.cursor.store(last_update_id, Ordering::SeqCst);
        }
    }

    source.stop().await;
    info!(cursor = last_update_id, "exiting update polling loop due to cancellation");
}

async fn worker_loop(
    worker: usize,
    queue: TaskQueue,
    tokens: Tokens,
    handler: Arc<dyn UpdateHandler>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = queue.lock().await;
            rx.recv().await
        };
        let Some(event) = next else {
            debug!(worker, "worker exits: task queue closed");
            return;
        };

        if tokens.acquire().await.is_err() {
            info!(worker, "worker exits: rate limiter closed");
            return;
        }

        let update_id = event.update_id;
        let outcome = AssertUnwindSafe(handler.handle(&cancel, event))
            .catch_unwind()
            .await;
        counters.handled.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                warn!(worker, update_id, error = %e, "update handler failed");
            }
            Err(payload) => {
                counters.panicked.fetch_add(1, Ordering::SeqCst);
                error!(
                    worker,
                    update_id,
                    panic = %panic_message(payload.as_ref()),
                    "recovered after update handler panicked"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
