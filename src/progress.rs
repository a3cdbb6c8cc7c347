//! Import progress reporting.
//!
//! Reports observable progress during `elastistack import` so users see how
//! many documents are still in flight. Progress is emitted on **stderr** so
//! stdout remains parseable for scripts.

use std::io::Write;

use crate::models::DeliveryReport;

/// A single progress event for an import.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Dump parsed; `records` goroutines found, `skipped` lines ignored.
    Parsed { records: u64, skipped: u64 },
    /// Delivery phase: `done` of `total` documents delivered or dropped.
    Delivering { done: u64, total: u64 },
    /// All workers finished.
    Done { report: DeliveryReport },
}

/// Reports import progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    /// Emit a progress event. Called from the import pipeline.
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "import  delivering  1,234 / 5,000 documents".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Parsed { records, skipped } => format!(
                "import  parsed  {} goroutines ({} lines skipped)\n",
                format_number(*records),
                format_number(*skipped)
            ),
            ProgressEvent::Delivering { done, total } => format!(
                "import  delivering  {} / {} documents\n",
                format_number(*done),
                format_number(*total)
            ),
            ProgressEvent::Done { report } => format!(
                "import  done  {} delivered, {} dropped\n",
                format_number(report.delivered),
                format_number(report.dropped + report.abandoned)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Parsed { records, skipped } => serde_json::json!({
                "event": "progress",
                "phase": "parsed",
                "records": records,
                "skipped": skipped
            }),
            ProgressEvent::Delivering { done, total } => serde_json::json!({
                "event": "progress",
                "phase": "delivering",
                "n": done,
                "total": total
            }),
            ProgressEvent::Done { report } => serde_json::json!({
                "event": "progress",
                "phase": "done",
                "delivered": report.delivered,
                "dropped": report.dropped,
                "abandoned": report.abandoned,
                "batches": report.batches,
                "retries": report.retries
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl std::str::FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => Err(format!(
                "invalid progress mode '{}': expected off, human, or json",
                other
            )),
        }
    }
}
