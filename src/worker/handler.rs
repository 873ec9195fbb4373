//! Handler and hook seams of the worker pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::store::Record;

/// Cooperative cancellation signal for one in-flight record.
///
/// Raised by the heartbeat loop when the record's cancel flag is observed
/// in the database. Handlers should poll it at safe stopping points; a
/// handler that ignores it simply runs to completion and loses the
/// ownership race on its terminal mark.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Handler failure, classified by what the worker should do with the record.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Retryable failure; the record is marked errored and may be retried
    /// subject to the queue's retry policy.
    #[error(transparent)]
    Transient(anyhow::Error),

    /// Non-retryable failure; the record is failed terminally.
    #[error(transparent)]
    Permanent(anyhow::Error),
}

impl HandlerError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }
}

/// Processes one claimed record.
#[async_trait]
pub trait Handler<R: Record>: Send + Sync {
    async fn handle(&self, record: &R, cancel: &CancelFlag) -> Result<(), HandlerError>;
}

/// Decision returned by [`Hooks::pre_dequeue`].
#[derive(Debug)]
pub enum DequeuePlan {
    /// Dequeue, intersecting the candidate set with these extra SQL
    /// predicates (may use `{column}` placeholders).
    Proceed(Vec<String>),
    /// Skip this poll cycle, e.g. because a local resource is exhausted.
    Skip,
}

/// Lifecycle extension points around the dequeue/handle cycle.
///
/// Every hook has a no-op default, so implementors override only the
/// moments they care about.
#[async_trait]
pub trait Hooks<R: Record>: Send + Sync {
    /// Called before each dequeue attempt.
    async fn pre_dequeue(&self) -> anyhow::Result<DequeuePlan> {
        Ok(DequeuePlan::Proceed(Vec::new()))
    }

    /// Called after a record is claimed, before the handler runs.
    async fn pre_handle(&self, _record: &R) {}

    /// Called after the record's terminal mark, regardless of outcome.
    async fn post_handle(&self, _record: &R) {}
}

/// Hooks implementation that does nothing.
pub struct NoopHooks;

#[async_trait]
impl<R: Record> Hooks<R> for NoopHooks {}
