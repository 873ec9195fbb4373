//! Concurrent polling driver over a [`crate::store::Store`].
//!
//! A `Worker` runs a fixed number of handler slots against one queue,
//! maintains heartbeats for every in-flight record, and routes handler
//! outcomes to the matching terminal mark. The `Resetter` is the companion
//! janitor that recovers records stranded by dead workers.

mod handler;
mod pool;
mod resetter;

pub use handler::{CancelFlag, DequeuePlan, Handler, HandlerError, Hooks, NoopHooks};
pub use pool::{default_hostname, Worker, WorkerHandle, WorkerOptions};
pub use resetter::{Resetter, ResetterHandle};
