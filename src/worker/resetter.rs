//! Periodic recovery of records stranded by dead workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::store::{Record, Store};

/// Runs [`Store::reset_stalled`] on a fixed interval.
///
/// Exactly one resetter per queue should run in a deployment; the
/// operation itself is idempotent, so an accidental second instance is
/// wasteful rather than harmful.
pub struct Resetter<R: Record> {
    store: Arc<Store<R>>,
    interval: Duration,
}

/// Running resetter task.
pub struct ResetterHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ResetterHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl<R: Record> Resetter<R> {
    pub fn new(store: Arc<Store<R>>, interval: Duration) -> Self {
        Self { store, interval }
    }

    pub fn start(self) -> ResetterHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let queue = self.store.options().name.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rx.changed() => return,
                    _ = tokio::time::sleep(self.interval) => {}
                }

                match self.store.reset_stalled().await {
                    Ok((reset, failed)) => {
                        for (id, age) in &reset {
                            tracing::info!(
                                queue = %queue,
                                record_id = id,
                                heartbeat_age_secs = age.as_secs(),
                                "requeued stalled record"
                            );
                        }
                        for (id, age) in &failed {
                            tracing::warn!(
                                queue = %queue,
                                record_id = id,
                                heartbeat_age_secs = age.as_secs(),
                                "failed stalled record at reset cap"
                            );
                        }
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue, error = %e, "stall recovery failed");
                    }
                }
            }
        });

        ResetterHandle { shutdown, handle }
    }
}
