//! Error taxonomy for the import pipeline.
//!
//! Fatal errors ([`ImportError`], [`ParseError`]) abort a run before any
//! delivery starts. Everything else is recovered at the narrowest scope:
//! a [`RecordValidationError`] skips one record, a [`DeliveryError`] is
//! retried or drops one batch. [`PipelineError`] covers misuse of the
//! delivery pipeline and cancellation.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that stop an import before the pipeline is started.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("must specify a filename for --input")]
    MissingInput,

    #[error("could not read input file {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// The dump did not yield anything the record source recognizes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no goroutine records found in input ({skipped} lines skipped)")]
    NoRecords { skipped: usize },
}

/// A single record violates the record invariant and is skipped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordValidationError {
    #[error("goroutine {id}: idle duration is missing")]
    MissingIdle { id: u64 },

    #[error("goroutine {id}: idle duration is negative ({minutes} minutes)")]
    NegativeIdle { id: u64, minutes: i64 },

    #[error("goroutine {id}: idle duration of {minutes} minutes is out of range")]
    OutOfRange { id: u64, minutes: i64 },
}

/// Outcome of a failed delivery attempt.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// May succeed if retried (network error, timeout, 429, 5xx).
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// Retrying will not help (rejected request, encoding failure).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    /// The backend answered but rate limited some items. Worth retrying;
    /// every item not listed in `failed_items` was indexed.
    #[error("transient delivery failure: {reason}")]
    RateLimited {
        reason: String,
        failed_items: Vec<(String, String)>,
    },
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryError::Transient(_) | DeliveryError::RateLimited { .. }
        )
    }

    /// Items the backend rejected individually, as `(id, reason)`.
    pub fn failed_items(&self) -> &[(String, String)] {
        match self {
            DeliveryError::RateLimited { failed_items, .. } => failed_items,
            _ => &[],
        }
    }
}

/// Misuse of the delivery pipeline, or a cancelled run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("delivery pipeline already started")]
    AlreadyStarted,

    #[error("delivery pipeline not started")]
    NotStarted,

    #[error("delivery pipeline needs at least one worker")]
    NoWorkers,

    #[error("delivery pipeline cancelled")]
    Cancelled,

    #[error("delivery worker panicked: {0}")]
    WorkerPanicked(String),
}
