//! Persistence and concurrency-control layer over one logical table of work
//! records.
//!
//! All database access uses Diesel with diesel-async. Per-queue SQL (table
//! names, remapped columns, ordering expressions) is issued through
//! `diesel::sql_query` with a `{column}` alias replacer so one store
//! implementation serves any table that honors the record column contract.
//!
//! Split into submodules:
//! - `pool.rs`: async SQLite connection factory
//! - `options.rs`: per-queue configuration and column aliasing
//! - `record.rs`: the `Record` trait binding a row type to the store
//! - `store.rs`: dequeue, heartbeat, requeue, log append, terminal marks,
//!   stalled-record recovery
//! - `metrics.rs`: explicit per-queue counter registry
//! - `migrations.rs`: embedded migrations for the built-in jobs table
//! - `time.rs`: RFC 3339 timestamp helpers

pub mod metrics;
pub mod migrations;
pub mod options;
pub mod pool;
pub mod record;
#[allow(clippy::module_inception)]
pub mod store;
pub mod time;

pub use metrics::{MetricsRegistry, QueueMetrics};
pub use migrations::run_migrations;
pub use options::{ExecutionLogEntryOptions, HeartbeatOptions, MarkFinalOptions, StoreOptions};
pub use pool::{AsyncSqliteConnection, AsyncSqlitePool, DieselError};
pub use record::Record;
pub use store::{Store, StoreError};
pub use time::{format_timestamp, parse_datetime, parse_datetime_opt};
