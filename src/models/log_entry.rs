//! Execution log entries appended to records while they are processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One entry in a record's append-only execution log.
///
/// Stored as an element of the JSON array in the `execution_logs` column.
/// Entries are appended while a record is `processing` and may be patched in
/// place afterwards (e.g. to fill in the exit code and captured output once
/// a subprocess finishes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    /// Short identifier for the step this entry describes.
    pub key: String,
    /// Command that was run, argv-style.
    pub command: Vec<String>,
    /// When the command started.
    pub start_time: Option<DateTime<Utc>>,
    /// Exit code, once known.
    pub exit_code: Option<i32>,
    /// Captured combined output.
    pub out: String,
    /// Wall-clock duration in milliseconds, once known.
    pub duration_ms: Option<i64>,
}

impl ExecutionLogEntry {
    pub fn new(key: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            key: key.into(),
            command,
            start_time: Some(Utc::now()),
            ..Default::default()
        }
    }
}
