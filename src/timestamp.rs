//! Event time inference.
//!
//! A goroutine dump only says how long each goroutine has been blocked. All
//! records of one run are anchored to a single [`CaptureInstant`] so that two
//! goroutines reported as "idle 5 minutes" resolve to the same absolute time.

use chrono::{DateTime, Duration, Utc};

use crate::error::RecordValidationError;

/// Reference time for every record of one import run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CaptureInstant(DateTime<Utc>);

impl CaptureInstant {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }
}

impl From<DateTime<Utc>> for CaptureInstant {
    fn from(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }
}

/// Returns `capture - idle_minutes`.
///
/// Returns `None` when the result falls outside the representable range.
/// Callers are expected to have rejected negative durations already.
pub fn infer_event_time(capture: CaptureInstant, idle_minutes: i64) -> Option<DateTime<Utc>> {
    let idle = Duration::try_minutes(idle_minutes)?;
    capture.0.checked_sub_signed(idle)
}

/// Validates a record's idle duration and infers its event time.
pub fn event_time_for(
    capture: CaptureInstant,
    id: u64,
    idle_minutes: Option<i64>,
) -> Result<(i64, DateTime<Utc>), RecordValidationError> {
    let minutes = idle_minutes.ok_or(RecordValidationError::MissingIdle { id })?;
    if minutes < 0 {
        return Err(RecordValidationError::NegativeIdle { id, minutes });
    }
    let event_time = infer_event_time(capture, minutes)
        .ok_or(RecordValidationError::OutOfRange { id, minutes })?;
    Ok((minutes, event_time))
}
