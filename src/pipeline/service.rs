use super::error::JobError;
use super::job::Job;
use super::job_store::JobStore;
use super::queue::{JobExecutor, JobQueue};
use super::runner::JobRunner;
use super::split_join::SplitJoinCoordinator;
use super::task::TaskRegistry;
use super::worker_pool::WorkerPool;
use crate::status::StatusStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The queue, job store, coordinator and runner wired together.
pub struct PipelineService {
    store: Arc<dyn StatusStore>,
    queue: Arc<JobQueue>,
    job_store: Arc<JobStore>,
    coordinator: Arc<SplitJoinCoordinator>,
    _runner: Arc<JobRunner>,
}

impl PipelineService {
    pub fn new(store: Arc<dyn StatusStore>, pool: Arc<dyn WorkerPool>, registry: TaskRegistry) -> Self {
        let queue = Arc::new(JobQueue::new(Arc::clone(&store), pool));
        let job_store = Arc::new(JobStore::new(Arc::clone(&store), Arc::clone(&queue)));
        let coordinator = Arc::new(SplitJoinCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&job_store),
            Arc::clone(&queue),
        ));
        let runner = Arc::new(JobRunner::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&coordinator),
            registry,
        ));
        let executor: Arc<dyn JobExecutor> = runner.clone();
        queue.set_executor(Arc::downgrade(&executor));

        Self {
            store,
            queue,
            job_store,
            coordinator,
            _runner: runner,
        }
    }

    pub fn store(&self) -> &Arc<dyn StatusStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn job_store(&self) -> &Arc<JobStore> {
        &self.job_store
    }

    pub fn coordinator(&self) -> &Arc<SplitJoinCoordinator> {
        &self.coordinator
    }

    pub fn submit(&self, job: Job) -> Result<(), JobError> {
        self.queue.add_job(job)
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Polls until the queue is empty. Once the queue is shut down, pending
    /// jobs are never dispatched and only in-flight ones are waited for.
    /// Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let settled = |queue: &JobQueue| {
            if queue.is_shut_down() {
                queue.is_quiescent()
            } else {
                queue.is_idle()
            }
        };
        while !settled(&self.queue) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}
