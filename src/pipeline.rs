//! Bulk delivery pipeline.
//!
//! Documents are pushed into a bounded queue by a single producer and
//! delivered by a fixed pool of workers, each sending small batches through
//! a [`Backend`]. The queue bound is the backpressure point: once it is
//! full, [`BulkPipeline::enqueue`] waits until a worker takes something out.
//!
//! ```text
//!  producer ──enqueue──▶ [ bounded queue ] ──▶ worker 0 ──┐
//!                                          ──▶ worker 1 ──┼──▶ Backend
//!                                          ──▶ worker N ──┘
//!         pending += 1                         pending -= batch
//! ```
//!
//! The pending count covers every document accepted but not yet delivered
//! or dropped. Workers never block the producer on a round trip and give no
//! ordering guarantee across documents; each document carries its own
//! ordinal and timestamp.
//!
//! # Lifecycle
//!
//! 1. [`BulkPipeline::new`] then [`start`](BulkPipeline::start) once.
//! 2. [`enqueue`](BulkPipeline::enqueue) every document.
//! 3. Either [`finish`](BulkPipeline::finish) and wait on the returned
//!    [`Drain`] (see [`crate::monitor`]), or [`stop`](BulkPipeline::stop)
//!    to abandon whatever is still queued.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::config::Config;
use crate::error::{DeliveryError, PipelineError};
use crate::models::{BulkAction, DeliveryReport, IndexableDocument};

/// Count of documents accepted but not yet delivered or dropped.
///
/// Waiters are woken whenever the count drops to zero.
#[derive(Debug, Default)]
pub struct PendingCounter {
    count: AtomicUsize,
    drained: Notify,
}

impl PendingCounter {
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    fn sub(&self, n: usize) {
        if n == 0 {
            return;
        }
        let previous = self.count.fetch_sub(n, Ordering::AcqRel);
        debug_assert!(previous >= n, "pending count underflow");
        if previous == n {
            self.drained.notify_waiters();
        }
    }

    /// Future resolving on the next transition to zero. Call `enable()` on
    /// it before checking [`get`](Self::get) so no wake-up is missed.
    pub fn drained(&self) -> tokio::sync::futures::Notified<'_> {
        self.drained.notified()
    }
}

/// State shared between the producer, the workers and the monitor.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    pub(crate) pending: PendingCounter,
    accepted: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    abandoned: AtomicU64,
    batches: AtomicU64,
    retries: AtomicU64,
}

impl Shared {
    pub(crate) fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Acquire)
    }

    pub(crate) fn report(&self) -> DeliveryReport {
        DeliveryReport {
            delivered: self.delivered.load(Ordering::Acquire),
            dropped: self.dropped.load(Ordering::Acquire),
            abandoned: self.abandoned.load(Ordering::Acquire),
            batches: self.batches.load(Ordering::Acquire),
            retries: self.retries.load(Ordering::Acquire),
        }
    }

    fn settle(&self, delivered: usize, dropped: usize, abandoned: usize) {
        self.delivered.fetch_add(delivered as u64, Ordering::AcqRel);
        self.dropped.fetch_add(dropped as u64, Ordering::AcqRel);
        self.abandoned.fetch_add(abandoned as u64, Ordering::AcqRel);
        self.pending.sub(delivered + dropped + abandoned);
    }
}

/// Per-run settings copied out of [`Config`].
#[derive(Debug, Clone)]
struct WorkerSettings {
    index: String,
    doc_type: Option<String>,
    batch_size: usize,
    max_retries: u32,
    retry_backoff: Duration,
    attempt_timeout: Duration,
}

type Queue = Arc<Mutex<mpsc::Receiver<IndexableDocument>>>;

/// Producer-side handle of the delivery pipeline.
pub struct BulkPipeline {
    tx: mpsc::Sender<IndexableDocument>,
    rx: Queue,
    shared: Arc<Shared>,
    backend: Arc<dyn Backend>,
    settings: Arc<WorkerSettings>,
    workers: JoinSet<()>,
    started: bool,
    /// Run-wide cancellation: interrupts enqueue, delivery and backoff.
    cancel: CancellationToken,
    /// Graceful stop: workers finish their current batch and exit.
    stop: CancellationToken,
}

impl BulkPipeline {
    pub fn new(config: &Config, backend: Arc<dyn Backend>, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(config.delivery.queue_capacity.max(1));
        let settings = WorkerSettings {
            index: config.backend.index.clone(),
            doc_type: config.backend.doc_type().map(str::to_string),
            batch_size: config.delivery.batch_size.max(1),
            max_retries: config.delivery.max_retries,
            retry_backoff: config.delivery.retry_backoff(),
            attempt_timeout: config.delivery.attempt_timeout(),
        };
        let stop = cancel.child_token();

        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            shared: Arc::new(Shared::default()),
            backend,
            settings: Arc::new(settings),
            workers: JoinSet::new(),
            started: false,
            cancel,
            stop,
        }
    }

    /// Spawns `worker_count` delivery workers on the current runtime.
    pub fn start(&mut self, worker_count: usize) -> Result<(), PipelineError> {
        if self.started {
            return Err(PipelineError::AlreadyStarted);
        }
        if worker_count == 0 {
            return Err(PipelineError::NoWorkers);
        }

        for worker_id in 0..worker_count {
            let worker = Worker {
                id: worker_id,
                rx: Arc::clone(&self.rx),
                shared: Arc::clone(&self.shared),
                backend: Arc::clone(&self.backend),
                settings: Arc::clone(&self.settings),
                cancel: self.cancel.clone(),
                stop: self.stop.clone(),
            };
            self.workers.spawn(worker.run());
        }
        self.started = true;

        info!(
            workers = worker_count,
            backend = self.backend.name(),
            batch_size = self.settings.batch_size,
            "delivery pipeline started"
        );
        Ok(())
    }

    /// Hands a document to the workers.
    ///
    /// Returns as soon as the document is queued; waits only while the
    /// queue is full.
    pub async fn enqueue(&self, doc: IndexableDocument) -> Result<(), PipelineError> {
        if !self.started {
            return Err(PipelineError::NotStarted);
        }

        self.shared.pending.add(1);
        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            result = self.tx.send(doc) => result.is_ok(),
        };

        if sent {
            self.shared.accepted.fetch_add(1, Ordering::AcqRel);
            Ok(())
        } else {
            self.shared.settle(0, 0, 1);
            Err(PipelineError::Cancelled)
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.get()
    }

    /// Closes the queue to further documents.
    ///
    /// Workers keep delivering until the queue is empty; the returned
    /// [`Drain`] lets the caller wait for that.
    pub fn finish(self) -> Result<Drain, PipelineError> {
        if !self.started {
            return Err(PipelineError::NotStarted);
        }
        debug!(accepted = self.shared.accepted(), "delivery queue closed");

        Ok(Drain {
            rx: self.rx,
            shared: self.shared,
            workers: self.workers,
            cancel: self.cancel,
        })
    }

    /// Stops the workers after their in-flight batch.
    ///
    /// Documents still queued are abandoned and counted as such.
    pub async fn stop(self) -> Result<DeliveryReport, PipelineError> {
        self.stop.cancel();
        let drain = Drain {
            rx: self.rx,
            shared: self.shared,
            workers: self.workers,
            cancel: self.cancel,
        };
        drain.join().await
    }
}

/// Consumer side of a closed pipeline.
///
/// Holding a `Drain` means no more documents can be enqueued, so a pending
/// count of zero is final.
pub struct Drain {
    rx: Queue,
    pub(crate) shared: Arc<Shared>,
    pub(crate) workers: JoinSet<()>,
    pub(crate) cancel: CancellationToken,
}

impl Drain {
    pub fn pending_count(&self) -> usize {
        self.shared.pending.get()
    }

    /// Documents accepted over the lifetime of the pipeline.
    pub fn accepted(&self) -> u64 {
        self.shared.accepted()
    }

    /// Waits for every worker to exit, abandons anything left in the queue,
    /// and returns the final accounting.
    pub async fn join(mut self) -> Result<DeliveryReport, PipelineError> {
        let mut panicked = None;
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!("delivery worker failed: {}", e);
                panicked.get_or_insert_with(|| e.to_string());
            }
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        let mut leftover = 0usize;
        while rx.try_recv().is_ok() {
            leftover += 1;
        }
        if leftover > 0 {
            warn!(documents = leftover, "abandoning undelivered documents");
            self.shared.settle(0, 0, leftover);
        }

        match panicked {
            Some(reason) => Err(PipelineError::WorkerPanicked(reason)),
            None => Ok(self.shared.report()),
        }
    }
}

enum BatchResult {
    Delivered { rejected: Vec<(String, String)> },
    Failed(DeliveryError),
    Cancelled,
}

struct Worker {
    id: usize,
    rx: Queue,
    shared: Arc<Shared>,
    backend: Arc<dyn Backend>,
    settings: Arc<WorkerSettings>,
    cancel: CancellationToken,
    stop: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "delivery worker started");

        loop {
            let batch = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                batch = next_batch(&self.rx, self.settings.batch_size) => batch,
            };
            if batch.is_empty() {
                // Queue closed and drained.
                break;
            }
            self.deliver(batch).await;
        }

        debug!(worker = self.id, "delivery worker stopped");
    }

    async fn deliver(&self, batch: Vec<IndexableDocument>) {
        let count = batch.len();
        let actions = match to_actions(&batch, &self.settings) {
            Ok(actions) => actions,
            Err(e) => {
                error!(worker = self.id, documents = count, "could not encode batch: {}", e);
                self.shared.settle(0, count, 0);
                return;
            }
        };

        match self.deliver_with_retry(&actions).await {
            BatchResult::Delivered { rejected } => {
                self.shared.batches.fetch_add(1, Ordering::AcqRel);
                for (id, reason) in &rejected {
                    error!(worker = self.id, doc_id = %id, "document rejected: {}", reason);
                }
                let dropped = rejected.len().min(count);
                self.shared.settle(count - dropped, dropped, 0);
            }
            BatchResult::Failed(DeliveryError::RateLimited {
                reason,
                failed_items,
            }) => {
                // The last answer still indexed everything it did not list.
                self.shared.batches.fetch_add(1, Ordering::AcqRel);
                error!(worker = self.id, "retries exhausted: {}", reason);
                for (id, reason) in &failed_items {
                    error!(worker = self.id, doc_id = %id, "document rejected: {}", reason);
                }
                let dropped = failed_items.len().min(count);
                self.shared.settle(count - dropped, dropped, 0);
            }
            BatchResult::Failed(e) => {
                error!(worker = self.id, documents = count, "dropping batch: {}", e);
                self.shared.settle(0, count, 0);
            }
            BatchResult::Cancelled => {
                self.shared.settle(0, 0, count);
            }
        }
    }

    async fn deliver_with_retry(&self, actions: &[BulkAction]) -> BatchResult {
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                self.shared.retries.fetch_add(1, Ordering::AcqRel);
                let delay = backoff_delay(self.settings.retry_backoff, attempt);
                tokio::select! {
                    _ = self.cancel.cancelled() => return BatchResult::Cancelled,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let attempt_result = tokio::select! {
                _ = self.cancel.cancelled() => return BatchResult::Cancelled,
                result = tokio::time::timeout(
                    self.settings.attempt_timeout,
                    self.backend.deliver(actions),
                ) => result,
            };

            let err = match attempt_result {
                Ok(Ok(outcome)) => {
                    return BatchResult::Delivered {
                        rejected: outcome.failed_items,
                    }
                }
                Ok(Err(e)) => e,
                Err(_) => DeliveryError::Transient(format!(
                    "attempt timed out after {:?}",
                    self.settings.attempt_timeout
                )),
            };

            if !err.is_transient() || attempt >= self.settings.max_retries {
                return BatchResult::Failed(err);
            }

            attempt += 1;
            warn!(
                worker = self.id,
                attempt,
                max_retries = self.settings.max_retries,
                "retrying batch: {}",
                err
            );
        }
    }
}

/// Takes one document, waiting if needed, then up to `batch_size - 1` more
/// without waiting. Empty means the queue is closed.
async fn next_batch(
    rx: &Mutex<mpsc::Receiver<IndexableDocument>>,
    batch_size: usize,
) -> Vec<IndexableDocument> {
    let mut rx = rx.lock().await;
    let Some(first) = rx.recv().await else {
        return Vec::new();
    };

    let mut batch = Vec::with_capacity(batch_size);
    batch.push(first);
    while batch.len() < batch_size {
        match rx.try_recv() {
            Ok(doc) => batch.push(doc),
            Err(_) => break,
        }
    }
    batch
}

fn to_actions(
    batch: &[IndexableDocument],
    settings: &WorkerSettings,
) -> Result<Vec<BulkAction>, serde_json::Error> {
    batch
        .iter()
        .map(|doc| {
            Ok(BulkAction {
                index: settings.index.clone(),
                doc_type: settings.doc_type.clone(),
                doc_id: doc.ordinal.to_string(),
                timestamp: doc.event_time,
                body: serde_json::to_value(doc)?,
            })
        })
        .collect()
}

/// Exponential backoff: base, 2×base, 4×base, ... capped at 2^5 × base.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * (1u32 << (attempt.saturating_sub(1)).min(5))
}
