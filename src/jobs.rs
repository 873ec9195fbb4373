//! The built-in `jobs` queue: shell-command jobs over the bundled schema.
//!
//! This is both the queue served by the CLI and a worked example of wiring
//! a record type into the generic store. Library consumers with their own
//! tables implement [`Record`] the same way and point a
//! [`StoreOptions`] at their schema instead.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Nullable, Text};
use diesel_async::RunQueryDsl;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::models::{ExecutionLogEntry, RecordState};
use crate::schema::jobs;
use crate::store::{
    format_timestamp, AsyncSqlitePool, ExecutionLogEntryOptions, Record, Store, StoreError,
    StoreOptions,
};
use crate::worker::{CancelFlag, Handler, HandlerError};

/// A shell-command job row, as projected by the store.
#[derive(Debug, QueryableByName, serde::Serialize)]
pub struct Job {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = Text)]
    pub state: String,
    #[diesel(sql_type = Text)]
    pub payload: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub failure_message: Option<String>,
    #[diesel(sql_type = Text)]
    pub queued_at: String,
    #[diesel(sql_type = Nullable<Text>)]
    pub started_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub last_heartbeat_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub finished_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub process_after: Option<String>,
    #[diesel(sql_type = BigInt)]
    pub num_resets: i64,
    #[diesel(sql_type = BigInt)]
    pub num_failures: i64,
    #[diesel(sql_type = Nullable<Text>)]
    pub execution_logs: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    pub worker_hostname: Option<String>,
    #[diesel(sql_type = Bool)]
    pub cancel: bool,
}

impl Record for Job {
    fn record_id(&self) -> i64 {
        self.id
    }
}

impl Job {
    /// Parsed execution log, empty when none has been written yet.
    pub fn execution_log(&self) -> Vec<ExecutionLogEntry> {
        self.execution_logs
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default()
    }
}

#[derive(Insertable)]
#[diesel(table_name = jobs)]
struct NewJob {
    state: String,
    payload: String,
    queued_at: String,
    process_after: Option<String>,
}

/// Store options for the bundled `jobs` table: oldest-first, 30s retry
/// backoff, three retries, three resets.
pub fn job_store_options(queue_name: &str) -> StoreOptions {
    let mut options = StoreOptions::new(queue_name, "jobs");
    options.column_expressions.push("payload".to_string());
    options.retry_after = Duration::from_secs(30);
    options.max_num_retries = 3;
    options
}

/// Insert a new queued job and return its id.
pub async fn enqueue_job(
    pool: &AsyncSqlitePool,
    payload: &str,
    process_after: Option<chrono::DateTime<Utc>>,
) -> Result<i64, StoreError> {
    let new_job = NewJob {
        state: "queued".to_string(),
        payload: payload.to_string(),
        queued_at: format_timestamp(Utc::now()),
        process_after: process_after.map(format_timestamp),
    };

    let mut conn = pool.get().await?;
    let id: i64 = diesel::insert_into(jobs::table)
        .values(&new_job)
        .returning(jobs::id)
        .get_result(&mut conn)
        .await?;
    Ok(id)
}

/// Handler that executes a job's payload as a shell command, recording an
/// execution log entry with the captured output and exit code.
pub struct CommandHandler {
    store: Arc<Store<Job>>,
    worker_hostname: String,
}

impl CommandHandler {
    pub fn new(store: Arc<Store<Job>>, worker_hostname: String) -> Self {
        Self {
            store,
            worker_hostname,
        }
    }
}

async fn wait_for_cancel(cancel: &CancelFlag) {
    while !cancel.is_raised() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[async_trait]
impl Handler<Job> for CommandHandler {
    async fn handle(&self, job: &Job, cancel: &CancelFlag) -> Result<(), HandlerError> {
        let start_time = Utc::now();

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&job.payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(HandlerError::transient)?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let capture = async move {
            let mut out = String::new();
            if let Some(mut handle) = stdout {
                let _ = handle.read_to_string(&mut out).await;
            }
            if let Some(mut handle) = stderr {
                let _ = handle.read_to_string(&mut out).await;
            }
            out
        };

        let (status, out) = tokio::select! {
            result = async { tokio::join!(child.wait(), capture) } => {
                let (status, out) = result;
                (status.map_err(HandlerError::transient)?, out)
            }
            _ = wait_for_cancel(cancel) => {
                let _ = child.kill().await;
                // Transient so the errored mark sees the cancel flag and
                // lands the record in `canceled`.
                return Err(HandlerError::transient(anyhow::anyhow!("job canceled")));
            }
        };

        let exit_code = status.code();
        let entry = ExecutionLogEntry {
            key: "run".to_string(),
            command: vec!["sh".to_string(), "-c".to_string(), job.payload.clone()],
            start_time: Some(start_time),
            exit_code,
            out,
            duration_ms: Some((Utc::now() - start_time).num_milliseconds()),
        };

        let log_options = ExecutionLogEntryOptions {
            worker_hostname: Some(self.worker_hostname.clone()),
            state: Some(RecordState::Processing),
        };
        if let Err(e) = self
            .store
            .add_execution_log_entry(job.id, &entry, log_options)
            .await
        {
            // Losing the log append means the record was reclaimed; the
            // terminal mark will report the same and wins.
            tracing::warn!(job_id = job.id, error = %e, "execution log append skipped");
        }

        if status.success() {
            Ok(())
        } else {
            Err(HandlerError::transient(anyhow::anyhow!(
                "command exited with {}",
                exit_code.map_or("signal".to_string(), |c| format!("status {c}"))
            )))
        }
    }
}

/// Per-state job counts for the status command.
#[derive(Debug, Default, serde::Serialize)]
pub struct QueueSummary {
    pub queued: i64,
    pub processing: i64,
    pub errored: i64,
    pub failed: i64,
    pub completed: i64,
    pub canceled: i64,
}

#[derive(QueryableByName)]
struct StateCountRow {
    #[diesel(sql_type = Text)]
    state: String,
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// Count jobs grouped by state.
pub async fn summarize_jobs(pool: &AsyncSqlitePool) -> Result<QueueSummary, StoreError> {
    let mut conn = pool.get().await?;
    let rows: Vec<StateCountRow> =
        diesel::sql_query("SELECT state AS state, COUNT(*) AS count FROM jobs GROUP BY state")
            .get_results(&mut conn)
            .await?;

    let mut summary = QueueSummary::default();
    for row in rows {
        match row.state.as_str() {
            "queued" => summary.queued = row.count,
            "processing" => summary.processing = row.count,
            "errored" => summary.errored = row.count,
            "failed" => summary.failed = row.count,
            "completed" => summary.completed = row.count,
            "canceled" => summary.canceled = row.count,
            _ => {}
        }
    }
    Ok(summary)
}
