//! Per-queue store configuration.
//!
//! `StoreOptions` describes the backing table, its column aliases, the
//! candidate ordering expression, and the recovery/retry parameters of one
//! queue. SQL templates throughout the store reference contract columns as
//! `{column}` placeholders; `replace_columns` rewrites them to the actual
//! column names of the target table.

use std::collections::HashMap;
use std::time::Duration;

use crate::models::RecordState;

/// Column names every backing table (or view) must provide, possibly under
/// alternate names.
pub const CONTRACT_COLUMNS: &[&str] = &[
    "id",
    "state",
    "failure_message",
    "queued_at",
    "started_at",
    "last_heartbeat_at",
    "finished_at",
    "process_after",
    "num_resets",
    "num_failures",
    "execution_logs",
    "worker_hostname",
    "cancel",
];

/// Default failure message written to records that have been reset the
/// maximum number of times.
pub const DEFAULT_RESET_FAILURE_MESSAGE: &str =
    "job processor died while handling this message too many times";

/// Configuration of a store over a particular table, columns, and expressions.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Name of the queue, used to key metrics and log messages.
    pub name: String,

    /// Name of the table containing work records. All mutation targets this
    /// table.
    pub table_name: String,

    /// Optional name of a view on top of the table, used when selecting
    /// dequeue candidates and projecting returned records. Lets a queue join
    /// in auxiliary data without a second round trip. Must preserve the
    /// column contract of the base table.
    pub view_name: Option<String>,

    /// Map from contract column names to actual column names in the target
    /// table, for retrofitting existing tables into the expected shape.
    pub alternate_column_names: HashMap<String, String>,

    /// SQL expression ordering candidate records during dequeue. May use
    /// `{column}` placeholders.
    pub order_by: String,

    /// Column expressions projected into the record returned by dequeue.
    /// Defaults to the contract columns. May use `{column}` placeholders.
    pub column_expressions: Vec<String>,

    /// Maximum allowed age of a processing record's `last_heartbeat_at`
    /// before the resetter considers its worker dead.
    pub stalled_max_age: Duration,

    /// Number of times a record may be reset back to `queued` before it is
    /// failed outright, preventing an infinite crash loop on one input.
    pub max_num_resets: i64,

    /// Overrides the default failure message written by the reset cap.
    pub reset_failure_message: Option<String>,

    /// Delay before an `errored` record becomes dequeuable again. Zero
    /// disables retries entirely.
    pub retry_after: Duration,

    /// Maximum number of explicit failures before a record is failed
    /// terminally. Zero disables retries entirely.
    pub max_num_retries: i64,
}

impl StoreOptions {
    /// Options for a queue over the given table, with contract-column
    /// projection and oldest-first ordering.
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            view_name: None,
            alternate_column_names: HashMap::new(),
            order_by: "{id} ASC".to_string(),
            column_expressions: CONTRACT_COLUMNS
                .iter()
                .map(|c| format!("{{{c}}}"))
                .collect(),
            stalled_max_age: Duration::from_secs(120),
            max_num_resets: 3,
            reset_failure_message: None,
            retry_after: Duration::ZERO,
            max_num_retries: 0,
        }
    }

    /// The relation candidate selection and projection read from.
    pub fn view(&self) -> &str {
        self.view_name.as_deref().unwrap_or(&self.table_name)
    }

    /// Actual column name for a contract column.
    pub fn column<'a>(&'a self, name: &'a str) -> &'a str {
        self.alternate_column_names
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }

    /// Rewrite `{column}` placeholders in a SQL fragment to the actual
    /// column names of the target table.
    pub fn replace_columns(&self, sql: &str) -> String {
        let mut out = sql.to_string();
        for name in CONTRACT_COLUMNS {
            let placeholder = format!("{{{name}}}");
            if out.contains(&placeholder) {
                out = out.replace(&placeholder, self.column(name));
            }
        }
        out
    }

    /// The projection used when returning records, column-replaced and
    /// comma-joined.
    pub fn projection(&self) -> String {
        self.column_expressions
            .iter()
            .map(|expr| self.replace_columns(expr))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn reset_failure_message(&self) -> &str {
        self.reset_failure_message
            .as_deref()
            .unwrap_or(DEFAULT_RESET_FAILURE_MESSAGE)
    }
}

/// Ownership guard for heartbeat updates.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatOptions {
    /// If set, only rows whose `worker_hostname` matches are touched.
    pub worker_hostname: Option<String>,
}

/// Ownership guard for execution log mutation.
///
/// A stale or ousted owner failing the guard receives a distinct "not
/// updated" error rather than silently corrupting a record another worker
/// now owns.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLogEntryOptions {
    /// If set, only rows whose `worker_hostname` matches are touched.
    pub worker_hostname: Option<String>,
    /// If set, only rows in this state are touched.
    pub state: Option<RecordState>,
}

/// Ownership guard for terminal transitions.
#[derive(Debug, Clone, Default)]
pub struct MarkFinalOptions {
    /// If set, only rows whose `worker_hostname` matches are touched.
    pub worker_hostname: Option<String>,
}
