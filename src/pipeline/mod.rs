//! Job orchestration: admission control, checkpoints, split/join and the
//! runner that drives jobs through their task steps.

mod error;
mod job;
mod job_store;
mod queue;
mod runner;
mod service;
mod split_join;
mod task;
pub mod tasks;
mod worker_pool;

pub use error::JobError;
pub use job::{Job, TaskStep};
pub use job_store::JobStore;
pub use queue::{CancelOutcome, JobExecutor, JobQueue, QueuePosition, QueuedJobInfo};
pub use runner::JobRunner;
pub use service::PipelineService;
pub use split_join::{split_in_progress, JoinOutcome, SplitJoinCoordinator, SplitOutcome, SplitRecord};
pub use task::{PipelineTask, TaskContext, TaskRegistry};
pub use worker_pool::{BlockingPool, InlinePool, Runnable, WorkerPool, DEFAULT_POOL_SIZE};
