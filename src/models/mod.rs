//! Core data model shared by every queue instance.

mod log_entry;
mod state;

pub use log_entry::ExecutionLogEntry;
pub use state::RecordState;
