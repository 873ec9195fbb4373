//! taskmill - relational-database-backed distributed work queue.
//!
//! Many independent worker processes pull units of work ("records") from a
//! shared table, process them, and report completion. The database is the
//! single source of truth for ownership and progress: claims, heartbeats,
//! stalled-record recovery, and terminal transitions are all mediated by
//! atomic row updates.
//!
//! The crate is split into three layers:
//!
//! - [`store`]: the generic persistence and concurrency-control layer over
//!   one logical table (or view) of work records.
//! - [`worker`]: the pool driver that repeatedly dequeues records and runs a
//!   user [`worker::Handler`] under bounded concurrency, plus the
//!   [`worker::Resetter`] that recovers records abandoned by crashed workers.
//! - [`manager`]: the transaction-scoped assignment manager for callers that
//!   need to hold a transaction open for the lifetime of processing.
//!
//! The built-in [`jobs`] queue (backed by the `jobs` table in the bundled
//! migrations) is the reference consumer, wired up by the `taskmill` binary.

pub mod cli;
pub mod jobs;
pub mod manager;
pub mod models;
pub mod schema;
pub mod store;
pub mod worker;

pub use manager::{AssignmentManager, AssignmentOutcome, ManagerOptions};
pub use models::{ExecutionLogEntry, RecordState};
pub use store::{
    AsyncSqlitePool, ExecutionLogEntryOptions, HeartbeatOptions, MarkFinalOptions,
    MetricsRegistry, QueueMetrics, Record, Store, StoreError, StoreOptions,
};
pub use worker::{
    CancelFlag, DequeuePlan, Handler, HandlerError, Hooks, NoopHooks, Resetter, Worker,
    WorkerHandle, WorkerOptions,
};
