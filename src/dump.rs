//! Goroutine dump parser.
//!
//! Turns the text of a Go stack dump (panic output, `SIGQUIT` dump, or
//! `debug.Stack()` output embedded in a larger log) into
//! [`ExecutionRecord`]s. Lines that are not part of a goroutine block are
//! collected in [`ParsedDump::skipped_lines`], so there is no need to clean
//! up a log file before importing it.
//!
//! # Format
//!
//! ```text
//! goroutine 18 [chan receive, 5 minutes, locked to thread]:
//! main.worker(0xc000012345, 0x2)
//!         /src/app/main.go:42 +0x1d
//! created by main.main in goroutine 1
//!         /src/app/main.go:17 +0x65
//! ```
//!
//! A goroutine without a duration in its header has been blocked for less
//! than a minute and is reported with `idle_minutes = Some(0)`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ParseError;
use crate::models::{ExecutionRecord, Frame};

static HEADER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^goroutine (\d+)\b[^\[]*\[(.*)\]:\s*$").expect("failed to compile header regex")
});
static FUNCTION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S.*)\((.*)\)$").expect("failed to compile function regex"));
static CREATED_BY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^created by (\S+)(?: in goroutine \d+)?$")
        .expect("failed to compile created-by regex")
});
static LOCATION_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s+(.+?):(\d+)(?: (\+0x[0-9a-fA-F]+))?(?:\s.*)?$")
        .expect("failed to compile location regex")
});
static IDLE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+) minutes?$").expect("failed to compile idle regex"));

const ELIDED_MARKER: &str = "...additional frames elided...";

/// Records found in a dump plus the lines that were not part of any record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDump {
    pub records: Vec<ExecutionRecord>,
    pub skipped_lines: Vec<String>,
}

/// Function line waiting for its location line.
struct PendingCall {
    function: String,
    args: String,
    created_by: bool,
}

/// Parses a full dump.
///
/// Fails with [`ParseError::NoRecords`] when the text contains no goroutine
/// header at all.
pub fn parse_dump(text: &str) -> Result<ParsedDump, ParseError> {
    let mut dump = ParsedDump::default();
    let mut current: Option<ExecutionRecord> = None;
    let mut pending: Option<PendingCall> = None;

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r');

        if let Some(caps) = HEADER_REGEX.captures(line) {
            flush_pending(&mut pending, &mut dump.skipped_lines);
            if let Some(record) = current.take() {
                dump.records.push(record);
            }
            match caps[1].parse::<u64>() {
                Ok(id) => current = Some(parse_header(id, &caps[2])),
                Err(_) => dump.skipped_lines.push(line.to_string()),
            }
            continue;
        }

        if line.trim().is_empty() {
            flush_pending(&mut pending, &mut dump.skipped_lines);
            if let Some(record) = current.take() {
                dump.records.push(record);
            }
            continue;
        }

        let Some(record) = current.as_mut() else {
            dump.skipped_lines.push(line.to_string());
            continue;
        };

        if line.trim() == ELIDED_MARKER {
            continue;
        }

        if let Some(call) = pending.take() {
            if let Some(caps) = LOCATION_REGEX.captures(line) {
                let Ok(line_number) = caps[2].parse::<u32>() else {
                    dump.skipped_lines.push(call_line(&call));
                    dump.skipped_lines.push(line.to_string());
                    continue;
                };
                let frame = Frame {
                    function: call.function,
                    args: call.args,
                    file: caps[1].to_string(),
                    line: line_number,
                    offset: caps.get(3).map(|m| m.as_str().to_string()),
                };
                if call.created_by {
                    record.created_by = Some(frame);
                } else {
                    record.frames.push(frame);
                }
                continue;
            }
            // A call without a location is not a frame we can index.
            dump.skipped_lines.push(call_line(&call));
        }

        if let Some(caps) = CREATED_BY_REGEX.captures(line) {
            pending = Some(PendingCall {
                function: caps[1].to_string(),
                args: String::new(),
                created_by: true,
            });
        } else if let Some(caps) = FUNCTION_REGEX.captures(line) {
            pending = Some(PendingCall {
                function: caps[1].to_string(),
                args: caps[2].to_string(),
                created_by: false,
            });
        } else {
            dump.skipped_lines.push(line.to_string());
        }
    }

    flush_pending(&mut pending, &mut dump.skipped_lines);
    if let Some(record) = current.take() {
        dump.records.push(record);
    }

    if dump.records.is_empty() {
        return Err(ParseError::NoRecords {
            skipped: dump.skipped_lines.len(),
        });
    }
    Ok(dump)
}

/// Splits `chan receive, 5 minutes, locked to thread` into its parts.
fn parse_header(id: u64, bracket: &str) -> ExecutionRecord {
    let mut parts = bracket.split(',').map(str::trim);
    let state = parts.next().unwrap_or_default().to_string();
    let mut idle_minutes = 0;
    let mut locked_to_thread = false;

    for part in parts {
        if let Some(caps) = IDLE_REGEX.captures(part) {
            idle_minutes = caps[1].parse().unwrap_or(i64::MAX);
        } else if part == "locked to thread" {
            locked_to_thread = true;
        }
    }

    ExecutionRecord {
        id,
        state,
        idle_minutes: Some(idle_minutes),
        locked_to_thread,
        frames: Vec::new(),
        created_by: None,
    }
}

fn flush_pending(pending: &mut Option<PendingCall>, skipped: &mut Vec<String>) {
    if let Some(call) = pending.take() {
        skipped.push(call_line(&call));
    }
}

fn call_line(call: &PendingCall) -> String {
    if call.created_by {
        format!("created by {}", call.function)
    } else {
        format!("{}({})", call.function, call.args)
    }
}
