//! Pipeline Server Library
//!
//! A persistent job queue with split/join fan-out, tracked job statuses and
//! periodic digest notifications.

pub mod config;
pub mod metrics;
pub mod notifications;
pub mod pipeline;
pub mod sqlite_persistence;
pub mod status;

// Re-export commonly used types for convenience
pub use pipeline::{Job, JobError, JobQueue, PipelineService, TaskStep};
pub use status::{JobStatus, SqliteStatusStore, StatusRecord, StatusStore};
