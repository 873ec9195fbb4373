//! Store integration tests against a real SQLite database.

use std::time::Duration;

use chrono::Utc;
use diesel::sql_types::{BigInt, Nullable, Text};
use diesel_async::SimpleAsyncConnection;
use tempfile::TempDir;

use taskmill::jobs::{enqueue_job, job_store_options, Job};
use taskmill::models::ExecutionLogEntry;
use taskmill::store::{
    run_migrations, AsyncSqlitePool, ExecutionLogEntryOptions, HeartbeatOptions, MarkFinalOptions,
    MetricsRegistry, QueueMetrics, Store, StoreError, StoreOptions,
};

async fn setup() -> (TempDir, AsyncSqlitePool) {
    let dir = TempDir::new().unwrap();
    let pool = AsyncSqlitePool::from_path(&dir.path().join("test.sqlite3"));
    run_migrations(pool.database_url()).await.unwrap();
    (dir, pool)
}

fn test_store(pool: &AsyncSqlitePool, options: StoreOptions) -> Store<Job> {
    Store::new(pool.clone(), options, &MetricsRegistry::new()).unwrap()
}

async fn exec(pool: &AsyncSqlitePool, sql: &str) {
    let mut conn = pool.get().await.unwrap();
    conn.batch_execute(sql).await.unwrap();
}

#[derive(diesel::QueryableByName)]
struct JobRow {
    #[diesel(sql_type = Text)]
    state: String,
    #[diesel(sql_type = BigInt)]
    num_failures: i64,
    #[diesel(sql_type = BigInt)]
    num_resets: i64,
    #[diesel(sql_type = Nullable<Text>)]
    failure_message: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    worker_hostname: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    execution_logs: Option<String>,
}

async fn fetch(pool: &AsyncSqlitePool, id: i64) -> JobRow {
    let mut conn = pool.get().await.unwrap();
    diesel_async::RunQueryDsl::get_result(
        diesel::sql_query(
            "SELECT state, num_failures, num_resets, failure_message, worker_hostname, \
             execution_logs FROM jobs WHERE id = ?",
        )
        .bind::<BigInt, _>(id),
        &mut conn,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_dequeue_claims_oldest_first() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    let first = enqueue_job(&pool, "echo one", None).await.unwrap();
    let second = enqueue_job(&pool, "echo two", None).await.unwrap();

    let job = store.dequeue("w1", &[]).await.unwrap().unwrap();
    assert_eq!(job.id, first);
    assert_eq!(job.state, "processing");
    assert_eq!(job.worker_hostname.as_deref(), Some("w1"));
    assert!(job.started_at.is_some());
    assert!(job.last_heartbeat_at.is_some());

    let job = store.dequeue("w1", &[]).await.unwrap().unwrap();
    assert_eq!(job.id, second);

    assert!(store.dequeue("w1", &[]).await.unwrap().is_none());
    assert_eq!(QueueMetrics::get(&store.metrics().dequeues), 2);
}

#[tokio::test]
async fn test_dequeue_respects_process_after() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    let delayed = Utc::now() + chrono::Duration::seconds(3600);
    enqueue_job(&pool, "echo later", Some(delayed)).await.unwrap();
    assert!(store.dequeue("w1", &[]).await.unwrap().is_none());

    let due = Utc::now() - chrono::Duration::seconds(1);
    let id = enqueue_job(&pool, "echo now", Some(due)).await.unwrap();
    let job = store.dequeue("w1", &[]).await.unwrap().unwrap();
    assert_eq!(job.id, id);
}

#[tokio::test]
async fn test_dequeue_conditions_filter_candidates() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    enqueue_job(&pool, "skip me", None).await.unwrap();
    let wanted = enqueue_job(&pool, "take me", None).await.unwrap();

    let conditions = vec!["payload LIKE 'take%'".to_string()];
    let job = store.dequeue("w1", &conditions).await.unwrap().unwrap();
    assert_eq!(job.id, wanted);
    assert!(store.dequeue("w1", &conditions).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_dequeue_claims_distinct_records() {
    let (_dir, pool) = setup().await;
    let store = std::sync::Arc::new(test_store(&pool, job_store_options("test")));

    for i in 0..4 {
        enqueue_job(&pool, &format!("echo {i}"), None).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..4 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .dequeue(&format!("w{i}"), &[])
                .await
                .unwrap()
                .map(|job| job.id)
        }));
    }

    let mut ids: Vec<i64> = Vec::new();
    for handle in handles {
        if let Some(id) = handle.await.unwrap() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4, "each record claimed exactly once");
}

#[tokio::test]
async fn test_dequeue_rejected_in_transaction_scope() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));
    enqueue_job(&pool, "echo hi", None).await.unwrap();

    let result = store.transactional().dequeue("w1", &[]).await;
    assert!(matches!(result, Err(StoreError::DequeueInTransaction)));
}

#[tokio::test]
async fn test_heartbeat_reports_known_and_canceled() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();

    let guard = HeartbeatOptions {
        worker_hostname: Some("w1".to_string()),
    };
    let (known, canceled) = store.heartbeat(&[id, 9999], guard.clone()).await.unwrap();
    assert_eq!(known, vec![id]);
    assert!(canceled.is_empty());

    exec(&pool, &format!("UPDATE jobs SET cancel = 1 WHERE id = {id}")).await;
    let (known, canceled) = store.heartbeat(&[id], guard).await.unwrap();
    assert_eq!(known, vec![id]);
    assert_eq!(canceled, vec![id]);

    // A different claimed hostname touches nothing.
    let other = HeartbeatOptions {
        worker_hostname: Some("w2".to_string()),
    };
    let (known, _) = store.heartbeat(&[id], other).await.unwrap();
    assert!(known.is_empty());
}

#[tokio::test]
async fn test_mark_complete_respects_ownership() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();

    let stranger = MarkFinalOptions {
        worker_hostname: Some("w2".to_string()),
    };
    assert!(!store.mark_complete(id, stranger).await.unwrap());
    assert_eq!(fetch(&pool, id).await.state, "processing");

    let owner = MarkFinalOptions {
        worker_hostname: Some("w1".to_string()),
    };
    assert!(store.mark_complete(id, owner.clone()).await.unwrap());
    assert_eq!(fetch(&pool, id).await.state, "completed");

    // Already terminal; a second mark reports false.
    assert!(!store.mark_complete(id, owner).await.unwrap());
}

#[tokio::test]
async fn test_mark_errored_retries_then_fails_at_cap() {
    let (_dir, pool) = setup().await;
    let mut options = job_store_options("test");
    options.retry_after = Duration::from_millis(50);
    options.max_num_retries = 2;
    let store = test_store(&pool, options);

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();
    assert!(store
        .mark_errored(id, "boom", MarkFinalOptions::default())
        .await
        .unwrap());

    let row = fetch(&pool, id).await;
    assert_eq!(row.state, "errored");
    assert_eq!(row.num_failures, 1);
    assert_eq!(row.failure_message.as_deref(), Some("boom"));

    // Not dequeuable until the retry-after delay has elapsed.
    assert!(store.dequeue("w1", &[]).await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = store.dequeue("w1", &[]).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert!(job.failure_message.is_none(), "claim clears previous attempt");

    // Second failure reaches the cap and the record fails terminally.
    assert!(store
        .mark_errored(id, "boom again", MarkFinalOptions::default())
        .await
        .unwrap());
    let row = fetch(&pool, id).await;
    assert_eq!(row.state, "failed");
    assert_eq!(row.num_failures, 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.dequeue("w1", &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_subsecond_retry_after_still_enables_retries() {
    let (_dir, pool) = setup().await;
    let mut options = job_store_options("test");
    options.retry_after = Duration::from_millis(50);
    let store = test_store(&pool, options);

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();
    store
        .mark_errored(id, "boom", MarkFinalOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let job = store.dequeue("w1", &[]).await.unwrap().unwrap();
    assert_eq!(job.id, id);
}

#[tokio::test]
async fn test_retries_disabled_without_retry_after() {
    let (_dir, pool) = setup().await;
    let mut options = job_store_options("test");
    options.retry_after = Duration::ZERO;
    let store = test_store(&pool, options);

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();
    store
        .mark_errored(id, "boom", MarkFinalOptions::default())
        .await
        .unwrap();

    assert!(store.dequeue("w1", &[]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_beats_retry() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();
    exec(&pool, &format!("UPDATE jobs SET cancel = 1 WHERE id = {id}")).await;

    assert!(store
        .mark_errored(id, "interrupted", MarkFinalOptions::default())
        .await
        .unwrap());
    let row = fetch(&pool, id).await;
    assert_eq!(row.state, "canceled");
    assert_eq!(row.num_failures, 1);
}

#[tokio::test]
async fn test_requeue_returns_record_to_queue() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();
    exec(&pool, &format!("UPDATE jobs SET cancel = 1 WHERE id = {id}")).await;

    store
        .requeue(id, Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();

    let row = fetch(&pool, id).await;
    assert_eq!(row.state, "queued");

    let job = store.dequeue("w2", &[]).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert!(!job.cancel, "requeue clears a pending cancellation");
}

#[tokio::test]
async fn test_execution_log_append_and_update() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();

    let mut entry = ExecutionLogEntry {
        key: "setup".to_string(),
        command: vec!["echo".to_string(), "hi".to_string()],
        start_time: Some(Utc::now()),
        exit_code: None,
        out: String::new(),
        duration_ms: None,
    };

    let guard = ExecutionLogEntryOptions {
        worker_hostname: Some("w1".to_string()),
        state: None,
    };
    let first = store
        .add_execution_log_entry(id, &entry, guard.clone())
        .await
        .unwrap();
    assert_eq!(first, 1);

    entry.key = "run".to_string();
    let second = store
        .add_execution_log_entry(id, &entry, guard.clone())
        .await
        .unwrap();
    assert_eq!(second, 2);

    entry.exit_code = Some(0);
    entry.out = "hi\n".to_string();
    store
        .update_execution_log_entry(id, first, &entry, guard.clone())
        .await
        .unwrap();

    let row = fetch(&pool, id).await;
    let log: Vec<ExecutionLogEntry> =
        serde_json::from_str(row.execution_logs.as_deref().unwrap()).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].exit_code, Some(0));
    assert_eq!(log[0].out, "hi\n");
    assert_eq!(log[1].key, "run");

    // Guard misses surface as a distinct error.
    let stranger = ExecutionLogEntryOptions {
        worker_hostname: Some("w2".to_string()),
        state: None,
    };
    let err = store
        .add_execution_log_entry(id, &entry, stranger)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ExecutionLogEntryNotUpdated));

    let err = store
        .update_execution_log_entry(id, 5, &entry, guard)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ExecutionLogEntryNotUpdated));
}

#[tokio::test]
async fn test_reset_stalled_requeues_then_fails() {
    let (_dir, pool) = setup().await;
    let mut options = job_store_options("test");
    options.stalled_max_age = Duration::from_millis(50);
    options.max_num_resets = 1;
    let store = test_store(&pool, options);

    let id = enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (reset, failed) = store.reset_stalled().await.unwrap();
    assert!(failed.is_empty());
    assert!(reset[&id] >= Duration::from_millis(50));
    let row = fetch(&pool, id).await;
    assert_eq!(row.state, "queued");
    assert_eq!(row.num_resets, 1);

    // Second stall exceeds the reset cap.
    store.dequeue("w1", &[]).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (reset, failed) = store.reset_stalled().await.unwrap();
    assert!(reset.is_empty());
    assert!(failed.contains_key(&id));

    let row = fetch(&pool, id).await;
    assert_eq!(row.state, "failed");
    assert_eq!(
        row.failure_message.as_deref(),
        Some("job processor died while handling this message too many times")
    );
}

#[tokio::test]
async fn test_reset_stalled_spares_live_records() {
    let (_dir, pool) = setup().await;
    let mut options = job_store_options("test");
    options.stalled_max_age = Duration::from_secs(3600);
    let store = test_store(&pool, options);

    enqueue_job(&pool, "echo hi", None).await.unwrap();
    store.dequeue("w1", &[]).await.unwrap().unwrap();

    let (reset, failed) = store.reset_stalled().await.unwrap();
    assert!(reset.is_empty());
    assert!(failed.is_empty());
}

#[tokio::test]
async fn test_queued_count_and_oldest_age() {
    let (_dir, pool) = setup().await;
    let store = test_store(&pool, job_store_options("test"));

    assert_eq!(store.queued_count(false, &[]).await.unwrap(), 0);
    assert_eq!(
        store.max_duration_in_queue().await.unwrap(),
        Duration::ZERO
    );

    let first = enqueue_job(&pool, "echo one", None).await.unwrap();
    enqueue_job(&pool, "echo two", None).await.unwrap();
    enqueue_job(&pool, "echo three", None).await.unwrap();

    let job = store.dequeue("w1", &[]).await.unwrap().unwrap();
    assert_eq!(job.id, first);

    assert_eq!(store.queued_count(false, &[]).await.unwrap(), 2);
    assert_eq!(store.queued_count(true, &[]).await.unwrap(), 3);

    // Retryable errored records count toward the backlog.
    store
        .mark_errored(job.id, "boom", MarkFinalOptions::default())
        .await
        .unwrap();
    assert_eq!(store.queued_count(false, &[]).await.unwrap(), 3);

    assert!(store.max_duration_in_queue().await.unwrap() > Duration::ZERO);
}

#[tokio::test]
async fn test_alternate_column_names_and_projection() {
    let (_dir, pool) = setup().await;
    exec(
        &pool,
        "CREATE TABLE tasks (
            task_id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_state TEXT NOT NULL DEFAULT 'queued',
            payload TEXT NOT NULL,
            failure_message TEXT,
            queued_at TEXT NOT NULL,
            started_at TEXT,
            last_heartbeat_at TEXT,
            finished_at TEXT,
            process_after TEXT,
            num_resets INTEGER NOT NULL DEFAULT 0,
            num_failures INTEGER NOT NULL DEFAULT 0,
            execution_logs TEXT,
            worker_hostname TEXT,
            cancel INTEGER NOT NULL DEFAULT 0
        );
        INSERT INTO tasks (payload, queued_at)
            VALUES ('echo remapped', strftime('%Y-%m-%dT%H:%M:%fZ', 'now'));",
    )
    .await;

    let mut options = StoreOptions::new("tasks", "tasks");
    options
        .alternate_column_names
        .insert("id".to_string(), "task_id".to_string());
    options
        .alternate_column_names
        .insert("state".to_string(), "task_state".to_string());
    options.column_expressions = vec![
        "{id} AS id".to_string(),
        "{state} AS state".to_string(),
        "failure_message".to_string(),
        "queued_at".to_string(),
        "started_at".to_string(),
        "last_heartbeat_at".to_string(),
        "finished_at".to_string(),
        "process_after".to_string(),
        "num_resets".to_string(),
        "num_failures".to_string(),
        "execution_logs".to_string(),
        "worker_hostname".to_string(),
        "cancel".to_string(),
        "payload".to_string(),
    ];
    let store: Store<Job> = test_store(&pool, options);

    let job = store.dequeue("w1", &[]).await.unwrap().unwrap();
    assert_eq!(job.payload, "echo remapped");
    assert_eq!(job.state, "processing");

    assert!(store
        .mark_complete(job.id, MarkFinalOptions::default())
        .await
        .unwrap());
}
