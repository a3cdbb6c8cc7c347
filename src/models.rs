//! Core data models used throughout the importer.
//!
//! These types represent the records, documents, and bulk actions that flow
//! through the import pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One call frame as it appears in the dump.
///
/// Frame data is opaque to the pipeline: it is parsed once and carried into
/// the indexed document verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub function: String,
    /// Raw argument list between the parentheses (`0xc000010000, 0x1`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub args: String,
    pub file: String,
    pub line: u32,
    /// Program counter offset (`+0x1d`), if the dump reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
}

/// A single goroutine as produced by the record source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRecord {
    pub id: u64,
    /// Wait reason from the header (`chan receive`, `running`, ...).
    pub state: String,
    /// Minutes the goroutine had been blocked at capture time.
    pub idle_minutes: Option<i64>,
    pub locked_to_thread: bool,
    pub frames: Vec<Frame>,
    pub created_by: Option<Frame>,
}

/// Document shipped to the index, one per accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexableDocument {
    pub ordinal: usize,
    pub id: u64,
    pub state: String,
    pub idle_minutes: i64,
    pub locked_to_thread: bool,
    #[serde(rename = "@timestamp")]
    pub event_time: DateTime<Utc>,
    pub frames: Vec<Frame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Frame>,
}

/// A single write handed to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    pub index: String,
    /// Mapping type; `None` for backends that no longer support types.
    pub doc_type: Option<String>,
    pub doc_id: String,
    pub timestamp: DateTime<Utc>,
    pub body: serde_json::Value,
}

/// Result of a bulk call that reached the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Document ids the backend rejected individually, with the reason.
    pub failed_items: Vec<(String, String)>,
}

/// Final accounting for a pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: u64,
    pub dropped: u64,
    pub abandoned: u64,
    pub batches: u64,
    pub retries: u64,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.dropped == 0 && self.abandoned == 0
    }
}
