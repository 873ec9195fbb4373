//! The worker pool: handler slots, heartbeats, and outcome routing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::{HeartbeatOptions, MarkFinalOptions, Record, Store};

use super::handler::{CancelFlag, DequeuePlan, Handler, HandlerError, Hooks, NoopHooks};

/// This process's hostname, used to tag claimed records. Falls back to
/// "unknown" when the hostname cannot be resolved.
pub fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Configuration of one worker pool.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Name used in log messages.
    pub name: String,

    /// Number of concurrent handler slots.
    pub num_handlers: usize,

    /// Sleep between polls when the queue is empty.
    pub interval: Duration,

    /// Interval between heartbeat batches for in-flight records. Must be
    /// comfortably below the queue's `stalled_max_age`.
    pub heartbeat_interval: Duration,

    /// If set, a handler invocation exceeding this duration is abandoned
    /// and its record failed terminally.
    pub maximum_runtime_per_job: Option<Duration>,

    /// Hostname written into claimed records and used as the ownership
    /// guard on heartbeats and terminal marks.
    pub worker_hostname: String,
}

impl WorkerOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            num_handlers: 1,
            interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            maximum_runtime_per_job: None,
            worker_hostname: default_hostname(),
        }
    }
}

/// Polls a queue and drives records through handler invocations.
pub struct Worker<R: Record> {
    store: Arc<Store<R>>,
    handler: Arc<dyn Handler<R>>,
    hooks: Arc<dyn Hooks<R>>,
    options: WorkerOptions,
}

/// Running worker; dropping it without calling [`WorkerHandle::stop`]
/// detaches the tasks.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for all slots to finish their current
    /// record. No new records are claimed after this is called.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

impl<R: Record> Worker<R> {
    pub fn new(store: Arc<Store<R>>, handler: Arc<dyn Handler<R>>, options: WorkerOptions) -> Self {
        Self {
            store,
            handler,
            hooks: Arc::new(NoopHooks),
            options,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks<R>>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Spawn the handler slots and the heartbeat loop.
    pub fn start(self) -> WorkerHandle {
        let (shutdown, _) = watch::channel(false);
        let in_flight: Arc<Mutex<HashMap<i64, CancelFlag>>> = Arc::new(Mutex::new(HashMap::new()));

        let mut handles = Vec::with_capacity(self.options.num_handlers + 1);

        handles.push(tokio::spawn(heartbeat_loop(
            self.store.clone(),
            self.options.clone(),
            in_flight.clone(),
            shutdown.subscribe(),
        )));

        for slot in 0..self.options.num_handlers {
            handles.push(tokio::spawn(handler_loop(
                slot,
                self.store.clone(),
                self.handler.clone(),
                self.hooks.clone(),
                self.options.clone(),
                in_flight.clone(),
                shutdown.subscribe(),
            )));
        }

        tracing::info!(
            worker = %self.options.name,
            queue = %self.store.options().name,
            handlers = self.options.num_handlers,
            "worker started"
        );
        WorkerHandle { shutdown, handles }
    }
}

fn in_flight_ids(in_flight: &Mutex<HashMap<i64, CancelFlag>>) -> Vec<i64> {
    let guard = in_flight.lock().unwrap_or_else(|e| e.into_inner());
    guard.keys().copied().collect()
}

/// Periodically refreshes heartbeats for every in-flight record and raises
/// cancel flags observed in the database. Records the store no longer
/// acknowledges (reset by the janitor, finalized elsewhere) are logged; the
/// owning slot discovers the loss when its terminal mark reports false.
async fn heartbeat_loop<R: Record>(
    store: Arc<Store<R>>,
    options: WorkerOptions,
    in_flight: Arc<Mutex<HashMap<i64, CancelFlag>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(options.heartbeat_interval) => {}
        }

        let ids = in_flight_ids(&in_flight);
        if ids.is_empty() {
            continue;
        }

        let heartbeat_options = HeartbeatOptions {
            worker_hostname: Some(options.worker_hostname.clone()),
        };
        match store.heartbeat(&ids, heartbeat_options).await {
            Ok((known, canceled)) => {
                for id in &ids {
                    if !known.contains(id) {
                        tracing::warn!(
                            worker = %options.name,
                            record_id = id,
                            "in-flight record no longer owned by this worker"
                        );
                    }
                }

                let guard = in_flight.lock().unwrap_or_else(|e| e.into_inner());
                for id in canceled {
                    if let Some(flag) = guard.get(&id) {
                        tracing::info!(worker = %options.name, record_id = id, "cancel requested");
                        flag.raise();
                    }
                }
            }
            Err(e) => {
                tracing::error!(worker = %options.name, error = %e, "heartbeat failed");
            }
        }
    }
}

async fn handler_loop<R: Record>(
    slot: usize,
    store: Arc<Store<R>>,
    handler: Arc<dyn Handler<R>>,
    hooks: Arc<dyn Hooks<R>>,
    options: WorkerOptions,
    in_flight: Arc<Mutex<HashMap<i64, CancelFlag>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let conditions = match hooks.pre_dequeue().await {
            Ok(DequeuePlan::Proceed(conditions)) => conditions,
            Ok(DequeuePlan::Skip) => {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(options.interval) => continue,
                }
            }
            Err(e) => {
                tracing::error!(worker = %options.name, slot, error = %e, "pre-dequeue hook failed");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(options.interval) => continue,
                }
            }
        };

        let record = match store.dequeue(&options.worker_hostname, &conditions).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(options.interval) => continue,
                }
            }
            Err(e) => {
                tracing::error!(worker = %options.name, slot, error = %e, "dequeue failed");
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = tokio::time::sleep(options.interval) => continue,
                }
            }
        };

        process(&store, &handler, &hooks, &options, &in_flight, record).await;
    }
}

/// Run the handler for one claimed record and route its outcome to the
/// matching terminal mark.
async fn process<R: Record>(
    store: &Store<R>,
    handler: &Arc<dyn Handler<R>>,
    hooks: &Arc<dyn Hooks<R>>,
    options: &WorkerOptions,
    in_flight: &Mutex<HashMap<i64, CancelFlag>>,
    record: R,
) {
    let id = record.record_id();
    let cancel = CancelFlag::new();
    {
        let mut guard = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(id, cancel.clone());
    }

    hooks.pre_handle(&record).await;

    let outcome = match options.maximum_runtime_per_job {
        Some(max) => match tokio::time::timeout(max, handler.handle(&record, &cancel)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::permanent(anyhow::anyhow!(
                "handler exceeded maximum runtime of {max:?}"
            ))),
        },
        None => handler.handle(&record, &cancel).await,
    };

    let mark_options = MarkFinalOptions {
        worker_hostname: Some(options.worker_hostname.clone()),
    };
    let marked = match &outcome {
        Ok(()) => store.mark_complete(id, mark_options).await,
        Err(HandlerError::Transient(e)) => {
            store.mark_errored(id, &e.to_string(), mark_options).await
        }
        Err(HandlerError::Permanent(e)) => store.mark_failed(id, &e.to_string(), mark_options).await,
    };

    match marked {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(
                worker = %options.name,
                record_id = id,
                "terminal mark skipped, record was reassigned or finalized elsewhere"
            );
        }
        Err(e) => {
            tracing::error!(worker = %options.name, record_id = id, error = %e, "terminal mark failed");
        }
    }

    hooks.post_handle(&record).await;

    let mut guard = in_flight.lock().unwrap_or_else(|e| e.into_inner());
    guard.remove(&id);
}
