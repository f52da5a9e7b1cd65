use super::error::JobError;
use super::job::Job;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context handed to a task while it runs one step of a job.
#[derive(Clone)]
pub struct TaskContext {
    /// Cancelled when the job is cancelled or the queue shuts down.
    pub cancellation_token: CancellationToken,
}

impl TaskContext {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self { cancellation_token }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Returns `Err(JobError::Cancelled)` once cancellation was requested.
    pub fn check_cancelled(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            Err(JobError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The work behind a [`super::TaskStep`].
///
/// Tasks run on a worker thread and may block. Long running tasks should
/// poll `ctx.is_cancelled()` and bail out with [`JobError::Cancelled`].
pub trait PipelineTask: Send + Sync {
    fn id(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Runs the task against `job`, recording output in `job.results`.
    fn execute(&self, ctx: &TaskContext, job: &mut Job) -> Result<(), JobError>;
}

/// Tasks by id.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, Arc<dyn PipelineTask>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, task: Arc<dyn PipelineTask>) {
        self.tasks.insert(task.id(), task);
    }

    pub fn get(&self, task_id: &str) -> Option<Arc<dyn PipelineTask>> {
        self.tasks.get(task_id).cloned()
    }

    pub fn task_ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.tasks.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
