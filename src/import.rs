//! Import orchestration.
//!
//! Coordinates one import run: read dump → parse → anchor timestamps →
//! build documents → bulk delivery → wait for completion. Invalid records
//! and failed deliveries are non-fatal; a missing input or an unparseable
//! dump stops the run before any delivery starts.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backend::{Backend, ElasticsearchBackend};
use crate::config::Config;
use crate::document::build_documents;
use crate::dump::parse_dump;
use crate::error::ImportError;
use crate::models::{DeliveryReport, ExecutionRecord};
use crate::monitor::CompletionMonitor;
use crate::pipeline::BulkPipeline;
use crate::progress::{ProgressEvent, ProgressMode, ProgressReporter};
use crate::timestamp::CaptureInstant;

/// Counts for one finished import.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportSummary {
    pub records: usize,
    pub rejected: usize,
    pub documents: usize,
    pub report: DeliveryReport,
}

pub async fn run_import(
    config: &Config,
    input: Option<&Path>,
    progress: ProgressMode,
    cancel: CancellationToken,
) -> Result<ImportSummary> {
    let path = input
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or(ImportError::MissingInput)?;

    let bytes = std::fs::read(path).map_err(|source| ImportError::Input {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);

    let dump = parse_dump(&text).map_err(ImportError::from)?;
    for line in &dump.skipped_lines {
        trace!(line = %line, "skipped non-goroutine line");
    }
    println!("Parsed {} goroutines", dump.records.len());

    let backend = ElasticsearchBackend::new(&config.backend, config.delivery.attempt_timeout())?;
    info!(url = backend.bulk_url(), "loading goroutine data");

    let reporter = progress.reporter();
    reporter.report(ProgressEvent::Parsed {
        records: dump.records.len() as u64,
        skipped: dump.skipped_lines.len() as u64,
    });

    let summary = import_records(
        config,
        Arc::new(backend),
        &dump.records,
        CaptureInstant::now(),
        reporter,
        cancel,
    )
    .await?;

    println!("import {}", path.display());
    println!("  goroutines parsed: {}", summary.records);
    println!("  records rejected: {}", summary.rejected);
    println!("  documents delivered: {}", summary.report.delivered);
    println!("  documents dropped: {}", summary.report.dropped);
    if summary.report.abandoned > 0 {
        println!("  documents abandoned: {}", summary.report.abandoned);
    }
    println!("  bulk requests: {}", summary.report.batches);
    println!("  retries: {}", summary.report.retries);
    println!("Goroutine data import complete");

    Ok(summary)
}

/// Builds documents for `records` and delivers them through `backend`.
///
/// Returns once every document was delivered or dropped.
pub async fn import_records(
    config: &Config,
    backend: Arc<dyn Backend>,
    records: &[ExecutionRecord],
    capture: CaptureInstant,
    reporter: Box<dyn ProgressReporter>,
    cancel: CancellationToken,
) -> Result<ImportSummary> {
    let docs = build_documents(records, capture);
    let documents = docs.len();
    let rejected = records.len() - documents;
    if rejected > 0 {
        warn!(rejected, "some records were skipped");
    }

    let mut pipeline = BulkPipeline::new(config, backend, cancel);
    pipeline.start(config.delivery.workers)?;

    let mut failure = None;
    for doc in docs {
        debug!("[{:03}] goroutine #{}", doc.ordinal, doc.id);
        if let Err(e) = pipeline.enqueue(doc).await {
            failure = Some(e);
            break;
        }
    }
    if let Some(e) = failure {
        if let Ok(report) = pipeline.stop().await {
            warn!(
                delivered = report.delivered,
                abandoned = report.abandoned,
                "import interrupted"
            );
        }
        return Err(e.into());
    }

    let drain = pipeline.finish()?;
    let monitor = CompletionMonitor::new(config.delivery.poll_interval(), reporter);
    let report = monitor.wait(drain).await?;

    if !report.is_clean() {
        warn!(
            dropped = report.dropped,
            abandoned = report.abandoned,
            "not every document was indexed"
        );
    }

    Ok(ImportSummary {
        records: records.len(),
        rejected,
        documents,
        report,
    })
}
