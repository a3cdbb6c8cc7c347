//! Completion detection for a closed delivery pipeline.
//!
//! The monitor waits on a [`Drain`] until the pending count reaches zero,
//! then joins the workers and yields the [`DeliveryReport`] exactly once.
//! It wakes on the counter's "reached zero" notification and also re-checks
//! every poll interval, reporting progress each time it wakes.
//!
//! Because a [`Drain`] can only be obtained by closing the pipeline, the
//! monitor cannot observe a transient zero between two enqueues.
//!
//! Reaching zero means every attempt finished, not that every document was
//! indexed; check [`DeliveryReport::dropped`] for that.

use std::time::Duration;

use tracing::debug;

use crate::error::PipelineError;
use crate::models::DeliveryReport;
use crate::pipeline::Drain;
use crate::progress::{ProgressEvent, ProgressReporter};

pub struct CompletionMonitor {
    poll_interval: Duration,
    reporter: Box<dyn ProgressReporter>,
}

impl CompletionMonitor {
    pub fn new(poll_interval: Duration, reporter: Box<dyn ProgressReporter>) -> Self {
        Self {
            poll_interval,
            reporter,
        }
    }

    /// Waits until every accepted document was delivered or dropped.
    ///
    /// Returns [`PipelineError::Cancelled`] if the run is cancelled first;
    /// the workers are still joined and leftovers abandoned in that case.
    pub async fn wait(&self, mut drain: Drain) -> Result<DeliveryReport, PipelineError> {
        let total = drain.accepted();

        loop {
            let shared = std::sync::Arc::clone(&drain.shared);
            let notified = shared.pending.drained();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let pending = drain.pending_count();
            self.reporter.report(ProgressEvent::Delivering {
                done: total.saturating_sub(pending as u64),
                total,
            });
            if pending == 0 {
                break;
            }

            tokio::select! {
                _ = drain.cancel.cancelled() => {
                    let _ = drain.join().await;
                    return Err(PipelineError::Cancelled);
                }
                Some(result) = drain.workers.join_next(), if !drain.workers.is_empty() => {
                    if let Err(e) = result {
                        // The panicked worker's batch will never settle.
                        drain.cancel.cancel();
                        let _ = drain.join().await;
                        return Err(PipelineError::WorkerPanicked(e.to_string()));
                    }
                }
                _ = &mut notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {
                    debug!(pending, "waiting for delivery workers");
                }
            }
        }

        let report = drain.join().await?;
        self.reporter.report(ProgressEvent::Done { report });
        Ok(report)
    }
}
