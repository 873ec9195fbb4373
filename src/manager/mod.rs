//! Assignment manager for external executors.
//!
//! Some consumers cannot run inside this process as a [`crate::worker::Worker`]
//! handler: jobs are executed by remote, untrusted machines that talk to an
//! API. The `AssignmentManager` dequeues on their behalf, tracks which
//! remote worker holds which record, proxies heartbeats, and finalizes each
//! record atomically with any side-effect writes the executor's result
//! produces.
//!
//! The claim itself commits immediately, so the record's `processing` state
//! is visible to other dequeuers and to the resetter. Each assignment then
//! holds a dedicated connection with an open deferred transaction; the
//! terminal mark and any executor side effects run on that connection and
//! commit together, or roll back together if the ownership guard misses.
//! If this process crashes, the open transactions vanish with it and the
//! janitor (here or in a restarted instance, via the resetter) requeues the
//! stranded records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use diesel_async::SimpleAsyncConnection;
use tokio::sync::{watch, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;

use crate::store::{
    AsyncSqliteConnection, HeartbeatOptions, MarkFinalOptions, Record, Store, StoreError,
};

/// Configuration of an assignment manager.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Maximum number of concurrently open assignments. Each assignment
    /// pins a database connection with an open transaction, so this bounds
    /// resource usage; dequeue requests beyond the cap observe an empty
    /// queue rather than an error.
    pub maximum_assignments: usize,

    /// Grace period for an assignment whose worker has never sent a
    /// heartbeat. Past it the record is requeued, covering executors that
    /// took a job and vanished before reporting in.
    pub unreported_max_age: Duration,

    /// A worker whose last heartbeat is older than this is considered dead
    /// and all of its assignments are requeued.
    pub death_threshold: Duration,

    /// `process_after` delay applied when requeueing a reclaimed record,
    /// keeping a flapping executor from immediately re-claiming it.
    pub requeue_delay: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            maximum_assignments: 10,
            unreported_max_age: Duration::from_secs(60),
            death_threshold: Duration::from_secs(300),
            requeue_delay: Duration::from_secs(1),
        }
    }
}

/// How an executor reports the end of an assignment.
#[derive(Debug)]
pub enum AssignmentOutcome<'a> {
    Success,
    /// Retryable failure with the executor's error message.
    Errored(&'a str),
    /// Terminal failure with the executor's error message.
    Failed(&'a str),
}

struct Assignment {
    conn: AsyncSqliteConnection,
    claimed_at: Instant,
    reported: bool,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

struct WorkerAssignments {
    assignments: HashMap<i64, Assignment>,
    last_heartbeat: Instant,
}

/// Hands out queue records to named external workers and finalizes them
/// transactionally.
pub struct AssignmentManager<R: Record> {
    store: Arc<Store<R>>,
    options: ManagerOptions,
    semaphore: Arc<Semaphore>,
    workers: Mutex<HashMap<String, WorkerAssignments>>,
}

/// Running janitor task of a manager.
pub struct JanitorHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl JanitorHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl<R: Record> AssignmentManager<R> {
    pub fn new(store: Arc<Store<R>>, options: ManagerOptions) -> Self {
        let semaphore = Arc::new(Semaphore::new(options.maximum_assignments));
        Self {
            store,
            options,
            semaphore,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<Store<R>> {
        &self.store
    }

    /// Claim a record for the named worker. Returns `None` when the queue
    /// is empty or the assignment cap is reached.
    pub async fn dequeue(
        &self,
        worker_name: &str,
        conditions: &[String],
    ) -> Result<Option<R>, StoreError> {
        let permit = match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                tracing::debug!(worker = worker_name, "assignment cap reached");
                return Ok(None);
            }
            Err(TryAcquireError::Closed) => return Ok(None),
        };

        let Some(record) = self.store.dequeue(worker_name, conditions).await? else {
            return Ok(None);
        };
        let record_id = record.record_id();

        // Dedicated connection per assignment; its transaction stays open
        // until the executor reports an outcome.
        let mut conn = self.store.pool().get().await?;
        conn.batch_execute("BEGIN").await?;

        let now = Instant::now();
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let worker = workers
            .entry(worker_name.to_string())
            .or_insert_with(|| WorkerAssignments {
                assignments: HashMap::new(),
                last_heartbeat: now,
            });
        worker.assignments.insert(
            record_id,
            Assignment {
                conn,
                claimed_at: now,
                reported: false,
                _permit: permit,
            },
        );

        tracing::debug!(worker = worker_name, record_id, "record assigned");
        Ok(Some(record))
    }

    /// Process a heartbeat from an external worker: `ids` is the complete
    /// set of assignments the worker still believes it holds.
    ///
    /// Assignments absent from `ids` and older than the unreported grace
    /// period are reclaimed on the spot (transaction rolled back, record
    /// requeued, permit released): the executor has dropped them, so waiting
    /// for the death threshold would leak the record and the capacity.
    /// Only ids actually present in the bookkeeping map are proxied to the
    /// store, so an orphaned record stops receiving heartbeats and falls to
    /// the resetter.
    ///
    /// Returns the ids still owned by that worker and, of those, the ids
    /// requested to cancel.
    pub async fn heartbeat(
        &self,
        worker_name: &str,
        ids: &[i64],
    ) -> Result<(Vec<i64>, Vec<i64>), StoreError> {
        let now = Instant::now();
        let mut dropped: Vec<(i64, Assignment)> = Vec::new();
        let known_ids: Vec<i64>;
        {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            let Some(worker) = workers.get_mut(worker_name) else {
                return Ok((Vec::new(), Vec::new()));
            };
            worker.last_heartbeat = now;
            for id in ids {
                if let Some(assignment) = worker.assignments.get_mut(id) {
                    assignment.reported = true;
                }
            }

            let absent: Vec<i64> = worker
                .assignments
                .iter()
                .filter(|(id, assignment)| {
                    !ids.contains(id)
                        && now.duration_since(assignment.claimed_at)
                            > self.options.unreported_max_age
                })
                .map(|(id, _)| *id)
                .collect();
            for id in absent {
                if let Some(assignment) = worker.assignments.remove(&id) {
                    dropped.push((id, assignment));
                }
            }

            known_ids = ids
                .iter()
                .copied()
                .filter(|id| worker.assignments.contains_key(id))
                .collect();
            if worker.assignments.is_empty() {
                workers.remove(worker_name);
            }
        }

        for (id, assignment) in dropped {
            self.reclaim(worker_name, id, assignment).await?;
        }

        if known_ids.is_empty() {
            return Ok((Vec::new(), Vec::new()));
        }
        self.store
            .heartbeat(
                &known_ids,
                HeartbeatOptions {
                    worker_hostname: Some(worker_name.to_string()),
                },
            )
            .await
    }

    /// Execute side-effect statements inside the assignment's open
    /// transaction, so they commit or roll back together with the final
    /// mark. Returns `false` when the assignment is unknown.
    pub async fn run_in_assignment(
        &self,
        worker_name: &str,
        id: i64,
        sql: &str,
    ) -> Result<bool, StoreError> {
        let Some(mut assignment) = self.take_assignment(worker_name, id) else {
            return Ok(false);
        };

        let result = assignment.conn.batch_execute(sql).await;
        self.put_assignment(worker_name, id, assignment);
        result?;
        Ok(true)
    }

    /// Finalize an assignment. The terminal mark runs on the assignment's
    /// connection and commits together with any side effects staged via
    /// [`Self::run_in_assignment`]. Returns `false` without error when the
    /// assignment is unknown or the record was reclaimed in the meantime;
    /// in the latter case the whole transaction is rolled back.
    pub async fn complete(
        &self,
        worker_name: &str,
        id: i64,
        outcome: AssignmentOutcome<'_>,
    ) -> Result<bool, StoreError> {
        let Some(mut assignment) = self.take_assignment(worker_name, id) else {
            return Ok(false);
        };

        let mark_options = MarkFinalOptions {
            worker_hostname: Some(worker_name.to_string()),
        };
        let marked = match outcome {
            AssignmentOutcome::Success => {
                self.store
                    .mark_complete_in(&mut assignment.conn, id, mark_options)
                    .await
            }
            AssignmentOutcome::Errored(message) => {
                self.store
                    .mark_errored_in(&mut assignment.conn, id, message, mark_options)
                    .await
            }
            AssignmentOutcome::Failed(message) => {
                self.store
                    .mark_failed_in(&mut assignment.conn, id, message, mark_options)
                    .await
            }
        };

        match marked {
            Ok(true) => {
                assignment.conn.batch_execute("COMMIT").await?;
                tracing::debug!(worker = worker_name, record_id = id, "assignment finalized");
                Ok(true)
            }
            Ok(false) => {
                // Ownership guard missed; the record belongs to someone
                // else now, so the executor's side effects must not land.
                assignment.conn.batch_execute("ROLLBACK").await?;
                tracing::warn!(
                    worker = worker_name,
                    record_id = id,
                    "assignment finalization skipped, record reclaimed"
                );
                Ok(false)
            }
            Err(e) => {
                let _ = assignment.conn.batch_execute("ROLLBACK").await;
                Err(e)
            }
        }
    }

    /// Record ids currently assigned to the named worker.
    pub fn assigned(&self, worker_name: &str) -> Vec<i64> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers
            .get(worker_name)
            .map(|w| w.assignments.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Reclaim assignments from dead or unresponsive workers: every
    /// assignment of a worker past the death threshold, plus assignments
    /// never heartbeated within the unreported grace period. Reclaimed
    /// records are requeued with the configured delay. Returns the number
    /// of reclaimed assignments.
    pub async fn cleanup(&self) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut doomed: Vec<(String, i64, Assignment)> = Vec::new();

        {
            let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
            for (name, worker) in workers.iter_mut() {
                let worker_dead =
                    now.duration_since(worker.last_heartbeat) > self.options.death_threshold;
                let expired: Vec<i64> = worker
                    .assignments
                    .iter()
                    .filter(|(_, a)| {
                        worker_dead
                            || (!a.reported
                                && now.duration_since(a.claimed_at)
                                    > self.options.unreported_max_age)
                    })
                    .map(|(id, _)| *id)
                    .collect();
                for id in expired {
                    if let Some(assignment) = worker.assignments.remove(&id) {
                        doomed.push((name.clone(), id, assignment));
                    }
                }
            }
            workers.retain(|_, w| !w.assignments.is_empty());
        }

        let reclaimed = doomed.len();
        for (worker_name, id, assignment) in doomed {
            self.reclaim(&worker_name, id, assignment).await?;
        }
        Ok(reclaimed)
    }

    /// Roll back a reclaimed assignment's transaction and return its record
    /// to the queue with the configured delay. The permit releases when the
    /// assignment drops.
    async fn reclaim(
        &self,
        worker_name: &str,
        id: i64,
        mut assignment: Assignment,
    ) -> Result<(), StoreError> {
        let _ = assignment.conn.batch_execute("ROLLBACK").await;
        let after = chrono::Utc::now()
            + chrono::Duration::from_std(self.options.requeue_delay)
                .unwrap_or_else(|_| chrono::Duration::zero());
        self.store.requeue(id, after).await?;
        tracing::warn!(
            worker = %worker_name,
            record_id = id,
            "reclaimed assignment from unresponsive worker"
        );
        Ok(())
    }

    /// Spawn a background loop running [`Self::cleanup`] on an interval.
    pub fn start_janitor(self: Arc<Self>, interval: Duration) -> JanitorHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(e) = self.cleanup().await {
                    tracing::error!(error = %e, "assignment cleanup failed");
                }
            }
        });
        JanitorHandle { shutdown, handle }
    }

    fn take_assignment(&self, worker_name: &str, id: i64) -> Option<Assignment> {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let worker = workers.get_mut(worker_name)?;
        let assignment = worker.assignments.remove(&id);
        if worker.assignments.is_empty() && assignment.is_some() {
            workers.remove(worker_name);
        }
        assignment
    }

    fn put_assignment(&self, worker_name: &str, id: i64, assignment: Assignment) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        let worker = workers
            .entry(worker_name.to_string())
            .or_insert_with(|| WorkerAssignments {
                assignments: HashMap::new(),
                last_heartbeat: Instant::now(),
            });
        worker.assignments.insert(id, assignment);
    }
}
