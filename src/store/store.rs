//! The generic work-queue store.
//!
//! One `Store<R>` instance serves one queue: a table (or view) of work
//! records honoring the column contract in [`super::options`]. Every
//! mutation is a single SQL statement, so SQLite's statement-level writer
//! lock makes each transition atomic: concurrent dequeuers can never
//! double-claim a row, and a live heartbeat can never race a reset.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel_async::RunQueryDsl;
use thiserror::Error;

use crate::models::ExecutionLogEntry;

use super::metrics::{MetricsRegistry, QueueMetrics};
use super::options::{
    ExecutionLogEntryOptions, HeartbeatOptions, MarkFinalOptions, StoreOptions,
};
use super::pool::{AsyncSqliteConnection, AsyncSqlitePool, DieselError};
use super::record::Record;
use super::time::{format_timestamp, parse_datetime};

/// Errors surfaced by store operations.
///
/// Ownership races are deliberately *not* errors: a terminal mark whose
/// guard does not match any row reports `false`, because losing a race to
/// another claimant is a normal outcome under concurrent workers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Dequeue must own its own transaction boundary to claim safely; being
    /// invoked on a transaction-scoped store handle is a programmer error.
    #[error("dequeue must not be called from within a transaction")]
    DequeueInTransaction,

    /// An execution log mutation matched no row, either because the record
    /// is gone or because the ownership guard did not match.
    #[error("execution log entry not updated")]
    ExecutionLogEntryNotUpdated,

    #[error("invalid store options: {0}")]
    InvalidOptions(String),

    #[error("serializing execution log entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] DieselError),
}

/// Persistence and concurrency-control layer over one queue.
pub struct Store<R: Record> {
    pool: AsyncSqlitePool,
    options: StoreOptions,
    metrics: Arc<QueueMetrics>,
    in_transaction: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> Clone for Store<R> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            options: self.options.clone(),
            metrics: self.metrics.clone(),
            in_transaction: self.in_transaction,
            _record: PhantomData,
        }
    }
}

#[derive(diesel::QueryableByName)]
struct IdRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
}

#[derive(diesel::QueryableByName)]
struct HeartbeatRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = diesel::sql_types::Bool)]
    cancel: bool,
}

#[derive(diesel::QueryableByName)]
struct StalledRow {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    last_heartbeat_at: String,
}

#[derive(diesel::QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(diesel::QueryableByName)]
struct EntryIdRow {
    #[diesel(sql_type = BigInt)]
    entry_id: i64,
}

#[derive(diesel::QueryableByName)]
struct MarkedRow {
    #[diesel(sql_type = Text)]
    state: String,
}

#[derive(diesel::QueryableByName)]
struct OldestRow {
    #[diesel(sql_type = Nullable<Text>)]
    oldest_queued: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    oldest_retryable: Option<String>,
}

impl<R: Record> Store<R> {
    /// Create a store over the queue described by `options`. Metrics are
    /// keyed by the queue name in the given registry.
    pub fn new(
        pool: AsyncSqlitePool,
        options: StoreOptions,
        registry: &MetricsRegistry,
    ) -> Result<Self, StoreError> {
        if options.name.is_empty() {
            return Err(StoreError::InvalidOptions("queue name is required".into()));
        }
        if options.table_name.is_empty() {
            return Err(StoreError::InvalidOptions("table name is required".into()));
        }

        let metrics = registry.for_queue(&options.name);
        Ok(Self {
            pool,
            options,
            metrics,
            in_transaction: false,
            _record: PhantomData,
        })
    }

    /// A handle marked as running inside a caller-held transaction scope.
    /// Terminal marks on such a handle are fine; `dequeue` refuses to run,
    /// since a claim must not take row locks inside a foreign transaction.
    pub fn transactional(&self) -> Self {
        let mut store = self.clone();
        store.in_transaction = true;
        store
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    pub fn pool(&self) -> &AsyncSqlitePool {
        &self.pool
    }

    fn fq(&self, sql: &str) -> String {
        self.options.replace_columns(sql)
    }

    /// "AND (c1) AND (c2) ..." suffix for caller-supplied predicates;
    /// empty input yields an empty string. Each condition is parenthesized
    /// in case it contains an OR.
    fn condition_suffix(&self, conditions: &[String]) -> String {
        conditions
            .iter()
            .map(|c| format!(" AND ({})", self.fq(c)))
            .collect()
    }

    /// Count of records eligible or near-eligible for work: `queued`
    /// (optionally plus `processing`) and retryable `errored` records.
    /// Used for backpressure and autoscaling signals.
    pub async fn queued_count(
        &self,
        include_processing: bool,
        conditions: &[String],
    ) -> Result<i64, StoreError> {
        let states = if include_processing {
            "'queued', 'processing'"
        } else {
            "'queued'"
        };

        let sql = format!(
            "SELECT COUNT(*) AS count FROM {view} \
             WHERE ({{state}} IN ({states}) OR ({{state}} = 'errored' AND {{num_failures}} < ?)){conds}",
            view = self.options.view(),
            conds = self.condition_suffix(conditions),
        );

        let mut conn = self.pool.get().await?;
        let row: CountRow = diesel::sql_query(self.fq(&sql))
            .bind::<BigInt, _>(self.options.max_num_retries)
            .get_result(&mut conn)
            .await?;
        Ok(row.count)
    }

    /// Age of the oldest currently-eligible queued or retryable record;
    /// zero when there is none. Used for SLO alerting.
    pub async fn max_duration_in_queue(&self) -> Result<Duration, StoreError> {
        let now = Utc::now();
        let now_str = format_timestamp(now);

        let sql = format!(
            "SELECT \
                (SELECT MIN({{queued_at}}) FROM {table} \
                    WHERE {{state}} = 'queued' \
                    AND ({{process_after}} IS NULL OR {{process_after}} <= ?)) AS oldest_queued, \
                (SELECT MIN({{finished_at}}) FROM {table} \
                    WHERE {{state}} = 'errored' AND {{num_failures}} < ?) AS oldest_retryable",
            table = self.options.table_name,
        );

        let mut conn = self.pool.get().await?;
        let row: OldestRow = diesel::sql_query(self.fq(&sql))
            .bind::<Text, _>(now_str)
            .bind::<BigInt, _>(self.options.max_num_retries)
            .get_result(&mut conn)
            .await?;

        let mut oldest = Duration::ZERO;
        if let Some(queued_at) = row.oldest_queued.as_deref() {
            let age = (now - parse_datetime(queued_at)).to_std().unwrap_or_default();
            oldest = oldest.max(age);
        }
        if !self.options.retry_after.is_zero() {
            if let Some(finished_at) = row.oldest_retryable.as_deref() {
                // Eligible once the retry-after delay has elapsed.
                let age = (now - parse_datetime(finished_at)).to_std().unwrap_or_default();
                oldest = oldest.max(age.saturating_sub(self.options.retry_after));
            }
        }
        Ok(oldest)
    }

    /// Atomically claim the next eligible record for `worker_hostname`.
    ///
    /// Candidates are `queued` records whose `process_after` has passed and,
    /// when retries are enabled, `errored` records past their retry-after
    /// delay with failures below the cap, intersected with any
    /// caller-supplied predicates (which may use `{column}` placeholders and
    /// the view alias). The winning row moves to `processing` with
    /// `started_at`/`last_heartbeat_at` stamped, the worker bound, and all
    /// leftovers of a previous attempt cleared; the returned record is
    /// re-read from the view after the update so the caller sees the claimed
    /// state without a second round trip.
    ///
    /// Zero eligible rows is a normal outcome (`Ok(None)`). At most one row
    /// is claimed per call.
    pub async fn dequeue(
        &self,
        worker_hostname: &str,
        conditions: &[String],
    ) -> Result<Option<R>, StoreError> {
        if self.in_transaction {
            return Err(StoreError::DequeueInTransaction);
        }

        let now = Utc::now();
        let now_str = format_timestamp(now);
        // Millisecond resolution so sub-second backoffs still enable the
        // errored-retry branch.
        let retry_after_millis = self.options.retry_after.as_millis() as i64;
        let retry_cutoff = cutoff_timestamp(now, self.options.retry_after);

        let sql = format!(
            "UPDATE {table} SET \
                {{state}} = 'processing', \
                {{started_at}} = ?, \
                {{last_heartbeat_at}} = ?, \
                {{finished_at}} = NULL, \
                {{failure_message}} = NULL, \
                {{execution_logs}} = NULL, \
                {{worker_hostname}} = ? \
             WHERE {{id}} = ( \
                SELECT {{id}} FROM {view} \
                WHERE ( \
                    ({{state}} = 'queued' AND ({{process_after}} IS NULL OR {{process_after}} <= ?)) \
                    OR (? > 0 AND {{state}} = 'errored' AND {{num_failures}} < ? AND {{finished_at}} < ?) \
                ){conds} \
                ORDER BY {order} \
                LIMIT 1 \
             ) \
             AND {{state}} IN ('queued', 'errored') \
             RETURNING {{id}} AS id",
            table = self.options.table_name,
            view = self.options.view(),
            conds = self.condition_suffix(conditions),
            order = self.fq(&self.options.order_by),
        );

        let mut conn = self.pool.get().await?;
        let claimed: Vec<IdRow> = diesel::sql_query(self.fq(&sql))
            .bind::<Text, _>(&now_str)
            .bind::<Text, _>(&now_str)
            .bind::<Text, _>(worker_hostname)
            .bind::<Text, _>(&now_str)
            .bind::<BigInt, _>(retry_after_millis)
            .bind::<BigInt, _>(self.options.max_num_retries)
            .bind::<Text, _>(&retry_cutoff)
            .get_results(&mut conn)
            .await?;

        let Some(IdRow { id }) = claimed.into_iter().next() else {
            return Ok(None);
        };

        // Re-read through the view so projected expressions reflect the
        // post-dequeue row. The record is now owned by this worker, so the
        // second read is stable.
        let select = format!(
            "SELECT {projection} FROM {view} WHERE {id_col} = ?",
            projection = self.options.projection(),
            view = self.options.view(),
            id_col = self.options.column("id"),
        );
        let record: R = diesel::sql_query(select)
            .bind::<BigInt, _>(id)
            .get_result(&mut conn)
            .await?;

        QueueMetrics::incr(&self.metrics.dequeues);
        tracing::debug!(
            queue = %self.options.name,
            record_id = id,
            worker = worker_hostname,
            "dequeued record"
        );
        Ok(Some(record))
    }

    /// Refresh `last_heartbeat_at` on records still `processing` (and still
    /// owned, when the guard is set). Returns the ids that were refreshed
    /// and, of those, the ids flagged for cooperative cancellation. An id
    /// absent from the first list no longer exists in that state: it was
    /// reset, finalized by another process, or deleted.
    pub async fn heartbeat(
        &self,
        ids: &[i64],
        options: HeartbeatOptions,
    ) -> Result<(Vec<i64>, Vec<i64>), StoreError> {
        if ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }

        let id_list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        let sql = format!(
            "UPDATE {table} \
             SET {{last_heartbeat_at}} = ? \
             WHERE {{id}} IN ({id_list}) \
                AND {{state}} = 'processing' \
                AND (? IS NULL OR {{worker_hostname}} = ?) \
             RETURNING {{id}} AS id, {{cancel}} AS cancel",
            table = self.options.table_name,
        );

        let mut conn = self.pool.get().await?;
        let rows: Vec<HeartbeatRow> = diesel::sql_query(self.fq(&sql))
            .bind::<Text, _>(format_timestamp(Utc::now()))
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .get_results(&mut conn)
            .await?;

        QueueMetrics::add(&self.metrics.heartbeats, rows.len() as u64);

        let mut known = Vec::with_capacity(rows.len());
        let mut canceled = Vec::new();
        for row in rows {
            known.push(row.id);
            if row.cancel {
                canceled.push(row.id);
            }
        }
        Ok((known, canceled))
    }

    /// Unconditionally return a record to `queued`, delaying the next claim
    /// until `after`. Clears `started_at` and any pending cancellation.
    pub async fn requeue(&self, id: i64, after: DateTime<Utc>) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {table} \
             SET {{state}} = 'queued', {{process_after}} = ?, {{started_at}} = NULL, {{cancel}} = 0 \
             WHERE {{id}} = ?",
            table = self.options.table_name,
        );

        let mut conn = self.pool.get().await?;
        diesel::sql_query(self.fq(&sql))
            .bind::<Text, _>(format_timestamp(after))
            .bind::<BigInt, _>(id)
            .execute(&mut conn)
            .await?;

        QueueMetrics::incr(&self.metrics.requeues);
        tracing::debug!(queue = %self.options.name, record_id = id, "requeued record");
        Ok(())
    }

    /// Append an entry to the record's execution log and return its id
    /// (usable with [`Self::update_execution_log_entry`]). Fails with
    /// [`StoreError::ExecutionLogEntryNotUpdated`] when the guard misses.
    pub async fn add_execution_log_entry(
        &self,
        id: i64,
        entry: &ExecutionLogEntry,
        options: ExecutionLogEntryOptions,
    ) -> Result<i64, StoreError> {
        let entry_json = serde_json::to_string(entry)?;
        let state = options.state.map(|s| s.as_str().to_string());

        let sql = format!(
            "UPDATE {table} \
             SET {{execution_logs}} = json_insert(COALESCE({{execution_logs}}, '[]'), '$[#]', json(?)) \
             WHERE {{id}} = ? \
                AND (? IS NULL OR {{worker_hostname}} = ?) \
                AND (? IS NULL OR {{state}} = ?) \
             RETURNING json_array_length({{execution_logs}}) AS entry_id",
            table = self.options.table_name,
        );

        let mut conn = self.pool.get().await?;
        let rows: Vec<EntryIdRow> = diesel::sql_query(self.fq(&sql))
            .bind::<Text, _>(entry_json)
            .bind::<BigInt, _>(id)
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .bind::<Nullable<Text>, _>(state.as_deref())
            .bind::<Nullable<Text>, _>(state.as_deref())
            .get_results(&mut conn)
            .await?;

        match rows.into_iter().next() {
            Some(row) => Ok(row.entry_id),
            None => Err(StoreError::ExecutionLogEntryNotUpdated),
        }
    }

    /// Patch an existing execution log entry in place, guarded like
    /// [`Self::add_execution_log_entry`].
    pub async fn update_execution_log_entry(
        &self,
        id: i64,
        entry_id: i64,
        entry: &ExecutionLogEntry,
        options: ExecutionLogEntryOptions,
    ) -> Result<(), StoreError> {
        let entry_json = serde_json::to_string(entry)?;
        let state = options.state.map(|s| s.as_str().to_string());

        let sql = format!(
            "UPDATE {table} \
             SET {{execution_logs}} = json_replace({{execution_logs}}, '$[' || ? || ']', json(?)) \
             WHERE {{id}} = ? \
                AND json_array_length(COALESCE({{execution_logs}}, '[]')) >= ? \
                AND (? IS NULL OR {{worker_hostname}} = ?) \
                AND (? IS NULL OR {{state}} = ?) \
             RETURNING json_array_length({{execution_logs}}) AS entry_id",
            table = self.options.table_name,
        );

        let mut conn = self.pool.get().await?;
        let rows: Vec<EntryIdRow> = diesel::sql_query(self.fq(&sql))
            .bind::<BigInt, _>(entry_id - 1)
            .bind::<Text, _>(entry_json)
            .bind::<BigInt, _>(id)
            .bind::<BigInt, _>(entry_id)
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .bind::<Nullable<Text>, _>(state.as_deref())
            .bind::<Nullable<Text>, _>(state.as_deref())
            .get_results(&mut conn)
            .await?;

        if rows.is_empty() {
            return Err(StoreError::ExecutionLogEntryNotUpdated);
        }
        Ok(())
    }

    /// Transition `processing → completed`. Returns `false` without error
    /// when the record was already finalized or reassigned.
    pub async fn mark_complete(&self, id: i64, options: MarkFinalOptions) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        self.mark_complete_in(&mut conn, id, options).await
    }

    /// [`Self::mark_complete`] against a caller-held connection, so the mark
    /// can commit atomically with the caller's other writes.
    pub async fn mark_complete_in(
        &self,
        conn: &mut AsyncSqliteConnection,
        id: i64,
        options: MarkFinalOptions,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {table} \
             SET {{state}} = 'completed', {{finished_at}} = ? \
             WHERE {{id}} = ? AND {{state}} = 'processing' AND (? IS NULL OR {{worker_hostname}} = ?) \
             RETURNING {{id}} AS id",
            table = self.options.table_name,
        );

        let rows: Vec<IdRow> = diesel::sql_query(self.fq(&sql))
            .bind::<Text, _>(format_timestamp(Utc::now()))
            .bind::<BigInt, _>(id)
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .get_results(conn)
            .await?;

        let updated = !rows.is_empty();
        if updated {
            QueueMetrics::incr(&self.metrics.completes);
            tracing::debug!(queue = %self.options.name, record_id = id, "record completed");
        }
        Ok(updated)
    }

    /// Transition `processing →` retryable failure. Promotes to `canceled`
    /// when the cancel flag is set (cancel beats retry), to `failed` when
    /// this failure reaches the retry cap, and to `errored` otherwise;
    /// `num_failures` is incremented in every case. Returns `false` without
    /// error when the guard misses.
    pub async fn mark_errored(
        &self,
        id: i64,
        failure_message: &str,
        options: MarkFinalOptions,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        self.mark_errored_in(&mut conn, id, failure_message, options).await
    }

    /// [`Self::mark_errored`] against a caller-held connection.
    pub async fn mark_errored_in(
        &self,
        conn: &mut AsyncSqliteConnection,
        id: i64,
        failure_message: &str,
        options: MarkFinalOptions,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {table} \
             SET {{state}} = CASE \
                    WHEN {{cancel}} THEN 'canceled' \
                    WHEN {{num_failures}} + 1 >= ? THEN 'failed' \
                    ELSE 'errored' \
                END, \
                {{finished_at}} = ?, \
                {{failure_message}} = ?, \
                {{num_failures}} = {{num_failures}} + 1 \
             WHERE {{id}} = ? AND {{state}} = 'processing' AND (? IS NULL OR {{worker_hostname}} = ?) \
             RETURNING {{state}} AS state",
            table = self.options.table_name,
        );

        let rows: Vec<MarkedRow> = diesel::sql_query(self.fq(&sql))
            .bind::<BigInt, _>(self.options.max_num_retries)
            .bind::<Text, _>(format_timestamp(Utc::now()))
            .bind::<Text, _>(failure_message)
            .bind::<BigInt, _>(id)
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .get_results(conn)
            .await?;

        match rows.into_iter().next() {
            Some(row) => {
                QueueMetrics::incr(&self.metrics.erroreds);
                tracing::debug!(
                    queue = %self.options.name,
                    record_id = id,
                    state = %row.state,
                    failure = failure_message,
                    "record errored"
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Transition `processing → failed` terminally. Returns `false` without
    /// error when the guard misses.
    pub async fn mark_failed(
        &self,
        id: i64,
        failure_message: &str,
        options: MarkFinalOptions,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get().await?;
        self.mark_failed_in(&mut conn, id, failure_message, options).await
    }

    /// [`Self::mark_failed`] against a caller-held connection.
    pub async fn mark_failed_in(
        &self,
        conn: &mut AsyncSqliteConnection,
        id: i64,
        failure_message: &str,
        options: MarkFinalOptions,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            "UPDATE {table} \
             SET {{state}} = 'failed', \
                {{finished_at}} = ?, \
                {{failure_message}} = ?, \
                {{num_failures}} = {{num_failures}} + 1 \
             WHERE {{id}} = ? AND {{state}} = 'processing' AND (? IS NULL OR {{worker_hostname}} = ?) \
             RETURNING {{id}} AS id",
            table = self.options.table_name,
        );

        let rows: Vec<IdRow> = diesel::sql_query(self.fq(&sql))
            .bind::<Text, _>(format_timestamp(Utc::now()))
            .bind::<Text, _>(failure_message)
            .bind::<BigInt, _>(id)
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .bind::<Nullable<Text>, _>(options.worker_hostname.as_deref())
            .get_results(conn)
            .await?;

        let updated = !rows.is_empty();
        if updated {
            QueueMetrics::incr(&self.metrics.faileds);
            tracing::debug!(
                queue = %self.options.name,
                record_id = id,
                failure = failure_message,
                "record failed"
            );
        }
        Ok(updated)
    }

    /// Recover `processing` records whose heartbeat is older than
    /// `stalled_max_age`: requeue those still under the reset cap
    /// (incrementing `num_resets`), fail the rest. Returns maps from record
    /// id to heartbeat age for the reset and failed groups respectively.
    pub async fn reset_stalled(
        &self,
    ) -> Result<(HashMap<i64, Duration>, HashMap<i64, Duration>), StoreError> {
        let now = Utc::now();
        let stall_cutoff = cutoff_timestamp(now, self.options.stalled_max_age);
        let mut conn = self.pool.get().await?;

        let reset_sql = format!(
            "UPDATE {table} \
             SET {{state}} = 'queued', {{started_at}} = NULL, {{num_resets}} = {{num_resets}} + 1 \
             WHERE {{state}} = 'processing' AND {{last_heartbeat_at}} < ? AND {{num_resets}} < ? \
             RETURNING {{id}} AS id, {{last_heartbeat_at}} AS last_heartbeat_at",
            table = self.options.table_name,
        );
        let reset_rows: Vec<StalledRow> = diesel::sql_query(self.fq(&reset_sql))
            .bind::<Text, _>(&stall_cutoff)
            .bind::<BigInt, _>(self.options.max_num_resets)
            .get_results(&mut conn)
            .await?;

        let fail_sql = format!(
            "UPDATE {table} \
             SET {{state}} = 'failed', {{finished_at}} = ?, {{failure_message}} = ? \
             WHERE {{state}} = 'processing' AND {{last_heartbeat_at}} < ? AND {{num_resets}} >= ? \
             RETURNING {{id}} AS id, {{last_heartbeat_at}} AS last_heartbeat_at",
            table = self.options.table_name,
        );
        let failed_rows: Vec<StalledRow> = diesel::sql_query(self.fq(&fail_sql))
            .bind::<Text, _>(format_timestamp(now))
            .bind::<Text, _>(self.options.reset_failure_message())
            .bind::<Text, _>(&stall_cutoff)
            .bind::<BigInt, _>(self.options.max_num_resets)
            .get_results(&mut conn)
            .await?;

        let to_ages = |rows: Vec<StalledRow>| -> HashMap<i64, Duration> {
            rows.into_iter()
                .map(|row| {
                    let age = (now - parse_datetime(&row.last_heartbeat_at))
                        .to_std()
                        .unwrap_or_default();
                    (row.id, age)
                })
                .collect()
        };

        let reset = to_ages(reset_rows);
        let failed = to_ages(failed_rows);

        QueueMetrics::add(&self.metrics.resets, reset.len() as u64);
        QueueMetrics::add(&self.metrics.reset_failures, failed.len() as u64);
        if !reset.is_empty() || !failed.is_empty() {
            tracing::info!(
                queue = %self.options.name,
                reset = reset.len(),
                failed = failed.len(),
                "recovered stalled records"
            );
        }
        Ok((reset, failed))
    }
}

/// Timestamp `age` before `now`, formatted for column comparison.
fn cutoff_timestamp(now: DateTime<Utc>, age: Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::days(36500));
    format_timestamp(now.checked_sub_signed(age).unwrap_or(DateTime::UNIX_EPOCH))
}
