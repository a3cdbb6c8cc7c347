//! Record → document conversion.

use tracing::warn;

use crate::error::RecordValidationError;
use crate::models::{ExecutionRecord, IndexableDocument};
use crate::timestamp::{event_time_for, CaptureInstant};

/// Builds the document for one record.
///
/// Frame data is copied verbatim. Fails only when the record's idle
/// duration is missing, negative, or too large to anchor to `capture`.
pub fn build_document(
    ordinal: usize,
    record: &ExecutionRecord,
    capture: CaptureInstant,
) -> Result<IndexableDocument, RecordValidationError> {
    let (idle_minutes, event_time) = event_time_for(capture, record.id, record.idle_minutes)?;

    Ok(IndexableDocument {
        ordinal,
        id: record.id,
        state: record.state.clone(),
        idle_minutes,
        locked_to_thread: record.locked_to_thread,
        event_time,
        frames: record.frames.clone(),
        created_by: record.created_by.clone(),
    })
}

/// Builds documents for a whole dump in input order.
///
/// Invalid records are skipped with a warning and do not consume an
/// ordinal, so the returned ordinals are always `0..len`.
pub fn build_documents(
    records: &[ExecutionRecord],
    capture: CaptureInstant,
) -> Vec<IndexableDocument> {
    let mut docs = Vec::with_capacity(records.len());
    for (position, record) in records.iter().enumerate() {
        match build_document(docs.len(), record, capture) {
            Ok(doc) => docs.push(doc),
            Err(e) => warn!(position, "skipping record: {}", e),
        }
    }
    docs
}
