use super::error::JobError;
use super::job::Job;
use super::queue::{JobExecutor, JobQueue};
use super::split_join::{SplitJoinCoordinator, SplitOutcome};
use super::task::{TaskContext, TaskRegistry};
use crate::metrics;
use crate::status::{JobStatus, StatusRef, StatusStore, StatusUpdate};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Calls [`JobQueue::done`] however the run ends.
struct DoneGuard<'a> {
    queue: &'a JobQueue,
    guid: &'a str,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.queue.done(self.guid);
    }
}

/// Executes queued jobs step by step.
///
/// Split steps of top-level jobs go through the coordinator; everything else
/// runs the registered task. A child job joins its parent after its last
/// step, a top-level job is marked COMPLETE.
pub struct JobRunner {
    store: Arc<dyn StatusStore>,
    queue: Arc<JobQueue>,
    coordinator: Arc<SplitJoinCoordinator>,
    registry: TaskRegistry,
}

impl JobRunner {
    pub fn new(
        store: Arc<dyn StatusStore>,
        queue: Arc<JobQueue>,
        coordinator: Arc<SplitJoinCoordinator>,
        registry: TaskRegistry,
    ) -> Self {
        Self {
            store,
            queue,
            coordinator,
            registry,
        }
    }

    fn run(&self, mut job: Job, token: &CancellationToken) -> Result<JobStatus, JobError> {
        let status_ref = StatusRef::Guid(job.guid.clone());
        self.store.update(
            &status_ref,
            StatusUpdate {
                active_task: Some(job.active_task_id()),
                ..StatusUpdate::status(JobStatus::Running)
            },
        )?;

        while let Some(step) = job.active_task().cloned() {
            if token.is_cancelled() {
                return self.stop(&job);
            }

            if step.split && !job.is_split_child() {
                match self.coordinator.split(job.clone()) {
                    Ok(SplitOutcome::Waiting { .. }) => return Ok(JobStatus::Split),
                    Ok(SplitOutcome::Proceed(next)) => {
                        job = next;
                        continue;
                    }
                    Err(e) => return self.fail(&job, e),
                }
            }

            let Some(task) = self.registry.get(&step.task_id) else {
                return self.fail(&job, JobError::TaskNotFound(step.task_id.clone()));
            };
            debug!("Job {} running task {}", job.guid, step.task_id);
            let before_step = job.clone();
            match task.execute(&TaskContext::new(token.clone()), &mut job) {
                Ok(()) => {
                    if job.advance() {
                        let update = StatusUpdate::default()
                            .with_checkpoint(job.to_checkpoint()?, job.active_task_id());
                        self.store.update(&status_ref, update)?;
                    }
                }
                Err(JobError::Cancelled) => return self.stop(&before_step),
                Err(e) => return self.fail(&before_step, e),
            }
        }

        if job.is_split_child() {
            if let Err(e) = self.coordinator.join(&job) {
                error!(
                    "Job {} could not join parent {:?}: {}",
                    job.guid, job.parent_guid, e
                );
                self.store.update(
                    &status_ref,
                    StatusUpdate {
                        had_error: Some(true),
                        ..StatusUpdate::status(JobStatus::Error)
                    }
                    .with_info(format!("Join failed: {}", e)),
                )?;
                return Err(e);
            }
        } else {
            self.store
                .update(&status_ref, StatusUpdate::status(JobStatus::Complete))?;
            metrics::record_job_finished(JobStatus::Complete);
        }
        Ok(JobStatus::Complete)
    }

    /// Records a failed step. The checkpoint is the state before that step,
    /// so a retry runs it again from scratch.
    fn fail(&self, job: &Job, e: JobError) -> Result<JobStatus, JobError> {
        warn!("Job {} failed: {}", job.guid, e);
        let update = StatusUpdate {
            had_error: Some(true),
            ..StatusUpdate::status(JobStatus::Error)
        }
        .with_info(e.to_string())
        .with_checkpoint(job.to_checkpoint()?, job.active_task_id());
        self.store.update(&StatusRef::Guid(job.guid.clone()), update)?;
        metrics::record_job_finished(JobStatus::Error);
        Ok(JobStatus::Error)
    }

    /// Records a cooperative stop: INTERRUPTED on shutdown, CANCELLED otherwise.
    fn stop(&self, job: &Job) -> Result<JobStatus, JobError> {
        let status = if self.queue.is_shut_down() {
            JobStatus::Interrupted
        } else {
            JobStatus::Cancelled
        };
        let update = StatusUpdate::status(status)
            .with_checkpoint(job.to_checkpoint()?, job.active_task_id());
        self.store.update(&StatusRef::Guid(job.guid.clone()), update)?;
        metrics::record_job_finished(status);
        Ok(status)
    }
}

impl JobExecutor for JobRunner {
    fn execute(&self, job: Job, cancellation_token: CancellationToken) {
        let guid = job.guid.clone();
        let _done = DoneGuard {
            queue: &self.queue,
            guid: &guid,
        };

        let result = if self.queue.starting(&guid) {
            let started = Instant::now();
            let result = self.run(job, &cancellation_token);
            if let Ok(status) = &result {
                info!("Job {} ended as {} after {:?}", guid, status, started.elapsed());
            }
            result
        } else {
            match self.store.get(&StatusRef::Guid(guid.clone())) {
                Ok(Some(_)) => {
                    info!("Job {} was cancelled before it started", guid);
                    self.stop(&job)
                }
                Ok(None) => {
                    debug!("Job {} was discarded before it started", guid);
                    Ok(JobStatus::Cancelled)
                }
                Err(e) => Err(e.into()),
            }
        };

        if let Err(e) = result {
            error!("Job {} could not record its outcome: {}", guid, e);
        }
    }
}
