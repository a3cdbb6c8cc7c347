use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use elastistack::backend::{parse_bulk_response, Backend};
use elastistack::config::Config;
use elastistack::error::{DeliveryError, PipelineError};
use elastistack::import::import_records;
use elastistack::models::{BulkAction, BulkOutcome, ExecutionRecord, IndexableDocument};
use elastistack::monitor::CompletionMonitor;
use elastistack::pipeline::BulkPipeline;
use elastistack::progress::NoProgress;
use elastistack::timestamp::CaptureInstant;

// ============ Test backends ============

/// Records every action it receives; optionally waits on a gate first.
#[derive(Default)]
struct RecordingBackend {
    actions: Mutex<Vec<BulkAction>>,
    calls: AtomicUsize,
    gate: Option<watch::Receiver<bool>>,
}

impl RecordingBackend {
    fn gated() -> (Self, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let backend = Self {
            gate: Some(rx),
            ..Self::default()
        };
        (backend, tx)
    }

    fn doc_ids(&self) -> Vec<String> {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.doc_id.clone())
            .collect()
    }
}

#[async_trait]
impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    async fn deliver(&self, actions: &[BulkAction]) -> Result<BulkOutcome, DeliveryError> {
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            let _ = gate.wait_for(|open| *open).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.actions.lock().unwrap().extend_from_slice(actions);
        Ok(BulkOutcome::default())
    }
}

/// Fails the first `failures` calls with the given error kind.
struct FlakyBackend {
    failures: usize,
    transient: bool,
    calls: AtomicUsize,
}

#[async_trait]
impl Backend for FlakyBackend {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn deliver(&self, _actions: &[BulkAction]) -> Result<BulkOutcome, DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(if self.transient {
                DeliveryError::Transient("503 Service Unavailable".to_string())
            } else {
                DeliveryError::Permanent("400 Bad Request".to_string())
            });
        }
        Ok(BulkOutcome::default())
    }
}

/// Accepts every batch but rejects one document id.
struct RejectingBackend {
    reject_id: String,
}

#[async_trait]
impl Backend for RejectingBackend {
    fn name(&self) -> &str {
        "rejecting"
    }

    async fn deliver(&self, actions: &[BulkAction]) -> Result<BulkOutcome, DeliveryError> {
        let failed_items = actions
            .iter()
            .filter(|a| a.doc_id == self.reject_id)
            .map(|a| (a.doc_id.clone(), "mapper_parsing_exception".to_string()))
            .collect();
        Ok(BulkOutcome { failed_items })
    }
}

/// Indexes every item except one id, which is always answered with 429.
struct ThrottlingBackend {
    throttled_id: String,
    calls: AtomicUsize,
}

#[async_trait]
impl Backend for ThrottlingBackend {
    fn name(&self) -> &str {
        "throttling"
    }

    async fn deliver(&self, actions: &[BulkAction]) -> Result<BulkOutcome, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let items: Vec<serde_json::Value> = actions
            .iter()
            .map(|a| {
                if a.doc_id == self.throttled_id {
                    serde_json::json!({ "index": { "_id": a.doc_id, "status": 429,
                        "error": { "type": "es_rejected_execution_exception",
                            "reason": "rejected execution" } } })
                } else {
                    serde_json::json!({ "index": { "_id": a.doc_id, "status": 201 } })
                }
            })
            .collect();
        let throttled = actions.iter().any(|a| a.doc_id == self.throttled_id);
        parse_bulk_response(&serde_json::json!({ "errors": throttled, "items": items }))
    }
}

struct PanickingBackend;

#[async_trait]
impl Backend for PanickingBackend {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn deliver(&self, _actions: &[BulkAction]) -> Result<BulkOutcome, DeliveryError> {
        panic!("backend blew up");
    }
}

// ============ Helpers ============

fn test_config(workers: usize, queue_capacity: usize, batch_size: usize) -> Config {
    let mut config = Config::default();
    config.delivery.workers = workers;
    config.delivery.queue_capacity = queue_capacity;
    config.delivery.batch_size = batch_size;
    config.delivery.max_retries = 3;
    config.delivery.retry_backoff_ms = 1;
    config.delivery.attempt_timeout_secs = 5;
    config.delivery.poll_interval_ms = 20;
    config
}

fn capture() -> CaptureInstant {
    CaptureInstant::at(Utc.with_ymd_and_hms(2016, 5, 10, 12, 0, 0).unwrap())
}

fn doc(ordinal: usize) -> IndexableDocument {
    IndexableDocument {
        ordinal,
        id: ordinal as u64 + 1,
        state: "select".to_string(),
        idle_minutes: 0,
        locked_to_thread: false,
        event_time: capture().instant(),
        frames: Vec::new(),
        created_by: None,
    }
}

fn record(id: u64, idle_minutes: Option<i64>) -> ExecutionRecord {
    ExecutionRecord {
        id,
        state: "chan receive".to_string(),
        idle_minutes,
        locked_to_thread: false,
        frames: Vec::new(),
        created_by: None,
    }
}

fn monitor() -> CompletionMonitor {
    CompletionMonitor::new(Duration::from_millis(20), Box::new(NoProgress))
}

fn sorted_ids(ids: Vec<String>) -> Vec<usize> {
    let mut ids: Vec<usize> = ids.iter().map(|id| id.parse().unwrap()).collect();
    ids.sort_unstable();
    ids
}

async fn with_timeout<F: std::future::Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("pipeline did not finish in time")
}

// ============ Lifecycle ============

#[tokio::test]
async fn test_enqueue_before_start_fails() {
    let backend = Arc::new(RecordingBackend::default());
    let pipeline = BulkPipeline::new(&test_config(1, 4, 1), backend, CancellationToken::new());

    assert_eq!(pipeline.enqueue(doc(0)).await, Err(PipelineError::NotStarted));
    assert_eq!(pipeline.pending_count(), 0);
}

#[tokio::test]
async fn test_start_twice_fails() {
    let backend = Arc::new(RecordingBackend::default());
    let mut pipeline = BulkPipeline::new(&test_config(2, 4, 1), backend, CancellationToken::new());

    assert_eq!(pipeline.start(2), Ok(()));
    assert_eq!(pipeline.start(2), Err(PipelineError::AlreadyStarted));
    pipeline.stop().await.unwrap();
}

#[tokio::test]
async fn test_start_without_workers_fails() {
    let backend = Arc::new(RecordingBackend::default());
    let mut pipeline = BulkPipeline::new(&test_config(1, 4, 1), backend, CancellationToken::new());

    assert_eq!(pipeline.start(0), Err(PipelineError::NoWorkers));
}

// ============ Delivery ============

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drains_every_document_once() {
    let backend = Arc::new(RecordingBackend::default());
    let config = test_config(4, 16, 8);
    let mut pipeline = BulkPipeline::new(&config, backend.clone(), CancellationToken::new());
    pipeline.start(config.delivery.workers).unwrap();

    for i in 0..200 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }

    let drain = pipeline.finish().unwrap();
    let report = with_timeout(monitor().wait(drain)).await.unwrap();

    assert_eq!(report.delivered, 200);
    assert_eq!(report.dropped, 0);
    assert_eq!(report.abandoned, 0);
    assert!(report.batches >= 200 / 8);
    assert_eq!(sorted_ids(backend.doc_ids()), (0..200).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_backpressure_loses_nothing() {
    let (backend, gate) = RecordingBackend::gated();
    let backend = Arc::new(backend);
    let config = test_config(1, 2, 1);
    let mut pipeline = BulkPipeline::new(&config, backend.clone(), CancellationToken::new());
    pipeline.start(1).unwrap();

    let producer = async {
        for i in 0..10 {
            pipeline.enqueue(doc(i)).await.unwrap();
        }
    };
    let controller = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let pending_while_paused = pipeline.pending_count();
        let delivered_while_paused = backend.calls.load(Ordering::SeqCst);
        gate.send(true).unwrap();
        (pending_while_paused, delivered_while_paused)
    };
    let ((), (pending_while_paused, delivered_while_paused)) =
        with_timeout(async { tokio::join!(producer, controller) }).await;

    // One in flight, two queued, one waiting in enqueue.
    assert!(pending_while_paused < 10, "producer was not held back");
    assert_eq!(delivered_while_paused, 0);

    let drain = pipeline.finish().unwrap();
    let report = with_timeout(monitor().wait(drain)).await.unwrap();

    assert_eq!(report.delivered, 10);
    assert_eq!(sorted_ids(backend.doc_ids()), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let backend = Arc::new(FlakyBackend {
        failures: 2,
        transient: true,
        calls: AtomicUsize::new(0),
    });
    let config = test_config(1, 16, 16);
    let mut pipeline = BulkPipeline::new(&config, backend.clone(), CancellationToken::new());
    pipeline.start(1).unwrap();

    for i in 0..5 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }
    let report = with_timeout(monitor().wait(pipeline.finish().unwrap()))
        .await
        .unwrap();

    assert_eq!(report.delivered, 5);
    assert_eq!(report.dropped, 0);
    assert_eq!(report.retries, 2);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_exhausted_retries_drop_batch() {
    let backend = Arc::new(FlakyBackend {
        failures: usize::MAX,
        transient: true,
        calls: AtomicUsize::new(0),
    });
    let config = test_config(1, 16, 16);
    let mut pipeline = BulkPipeline::new(&config, backend.clone(), CancellationToken::new());
    pipeline.start(1).unwrap();

    for i in 0..3 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }
    let report = with_timeout(monitor().wait(pipeline.finish().unwrap()))
        .await
        .unwrap();

    assert_eq!(report.delivered, 0);
    assert_eq!(report.dropped, 3);
    assert_eq!(report.retries, 3);
    // First attempt plus max_retries.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let backend = Arc::new(FlakyBackend {
        failures: usize::MAX,
        transient: false,
        calls: AtomicUsize::new(0),
    });
    let config = test_config(1, 16, 16);
    let mut pipeline = BulkPipeline::new(&config, backend.clone(), CancellationToken::new());
    pipeline.start(1).unwrap();

    for i in 0..4 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }
    let report = with_timeout(monitor().wait(pipeline.finish().unwrap()))
        .await
        .unwrap();

    assert_eq!(report.dropped, 4);
    assert_eq!(report.retries, 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejected_items_are_dropped_individually() {
    let backend = Arc::new(RejectingBackend {
        reject_id: "2".to_string(),
    });
    let config = test_config(2, 16, 4);
    let mut pipeline = BulkPipeline::new(&config, backend, CancellationToken::new());
    pipeline.start(2).unwrap();

    for i in 0..6 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }
    let report = with_timeout(monitor().wait(pipeline.finish().unwrap()))
        .await
        .unwrap();

    assert_eq!(report.delivered, 5);
    assert_eq!(report.dropped, 1);
}

#[tokio::test]
async fn test_exhausted_rate_limit_drops_only_throttled_items() {
    let backend = Arc::new(ThrottlingBackend {
        throttled_id: "1".to_string(),
        calls: AtomicUsize::new(0),
    });
    let mut config = test_config(1, 16, 2);
    config.delivery.max_retries = 2;
    let mut pipeline = BulkPipeline::new(&config, backend.clone(), CancellationToken::new());
    pipeline.start(1).unwrap();

    for i in 0..2 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }
    let report = with_timeout(monitor().wait(pipeline.finish().unwrap()))
        .await
        .unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped, 1);
    assert_eq!(report.retries, 2);
    assert_eq!(report.abandoned, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_panic_ends_monitor() {
    let config = test_config(1, 16, 4);
    let mut pipeline =
        BulkPipeline::new(&config, Arc::new(PanickingBackend), CancellationToken::new());
    pipeline.start(1).unwrap();

    for i in 0..3 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }
    let result = with_timeout(monitor().wait(pipeline.finish().unwrap())).await;

    assert!(
        matches!(result, Err(PipelineError::WorkerPanicked(_))),
        "unexpected result: {:?}",
        result
    );
}

// ============ Stop and cancellation ============

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_abandons_queued_documents() {
    let (backend, gate) = RecordingBackend::gated();
    let backend = Arc::new(backend);
    let config = test_config(1, 16, 1);
    let mut pipeline = BulkPipeline::new(&config, backend.clone(), CancellationToken::new());
    pipeline.start(1).unwrap();

    for i in 0..5 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }
    // Let the worker pick up its first batch before stopping.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let opener = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.send(true).unwrap();
    };
    let (report, ()) = with_timeout(async { tokio::join!(pipeline.stop(), opener) }).await;
    let report = report.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.abandoned, 4);
    assert_eq!(backend.doc_ids(), vec!["0".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_unblocks_full_queue() {
    let (backend, _gate) = RecordingBackend::gated();
    let cancel = CancellationToken::new();
    let config = test_config(1, 1, 1);
    let mut pipeline = BulkPipeline::new(&config, Arc::new(backend), cancel.clone());
    pipeline.start(1).unwrap();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let mut result = Ok(());
    for i in 0..10 {
        result = pipeline.enqueue(doc(i)).await;
        if result.is_err() {
            break;
        }
    }
    assert_eq!(result, Err(PipelineError::Cancelled));

    let report = with_timeout(pipeline.stop()).await.unwrap();
    assert_eq!(report.delivered, 0);
    assert!(report.abandoned >= 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_ends_monitor() {
    let (backend, _gate) = RecordingBackend::gated();
    let cancel = CancellationToken::new();
    let config = test_config(2, 16, 1);
    let mut pipeline = BulkPipeline::new(&config, Arc::new(backend), cancel.clone());
    pipeline.start(2).unwrap();

    for i in 0..3 {
        pipeline.enqueue(doc(i)).await.unwrap();
    }
    let drain = pipeline.finish().unwrap();

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = with_timeout(monitor().wait(drain)).await;
    assert_eq!(result, Err(PipelineError::Cancelled));
}

// ============ End to end through the library ============

#[tokio::test]
async fn test_import_records_anchors_timestamps() {
    let backend = Arc::new(RecordingBackend::default());
    let records = vec![record(1, Some(0)), record(2, Some(-1)), record(3, Some(5))];

    let summary = import_records(
        &test_config(2, 8, 4),
        backend.clone(),
        &records,
        capture(),
        Box::new(NoProgress),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.records, 3);
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.documents, 2);
    assert_eq!(summary.report.delivered, 2);

    let mut actions = backend.actions.lock().unwrap().clone();
    actions.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));
    assert_eq!(actions.len(), 2);

    assert_eq!(actions[0].doc_id, "0");
    assert_eq!(actions[0].index, "stacktrace");
    assert_eq!(actions[0].doc_type.as_deref(), Some("goroutine"));
    assert_eq!(actions[0].body["id"], 1);
    assert_eq!(actions[0].body["@timestamp"], "2016-05-10T12:00:00Z");

    assert_eq!(actions[1].doc_id, "1");
    assert_eq!(actions[1].body["id"], 3);
    assert_eq!(actions[1].body["@timestamp"], "2016-05-10T11:55:00Z");
    assert_eq!(
        actions[1].timestamp,
        Utc.with_ymd_and_hms(2016, 5, 10, 11, 55, 0).unwrap()
    );
}

#[tokio::test]
async fn test_import_with_no_valid_records_delivers_nothing() {
    let backend = Arc::new(RecordingBackend::default());
    let records = vec![record(1, None), record(2, Some(-3))];

    let summary = import_records(
        &test_config(1, 8, 4),
        backend.clone(),
        &records,
        capture(),
        Box::new(NoProgress),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(summary.documents, 0);
    assert_eq!(summary.report.delivered, 0);
    assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    let unique: BTreeSet<String> = backend.doc_ids().into_iter().collect();
    assert!(unique.is_empty());
}
