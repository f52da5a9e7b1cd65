use super::error::JobError;
use super::job::Job;
use super::queue::JobQueue;
use crate::status::{JobStatus, StatusRecord, StatusRef, StatusStore, StatusUpdate};
use std::sync::Arc;
use tracing::{info, warn};

/// Durable checkpoints for jobs, plus retry and restart recovery on top of
/// them.
pub struct JobStore {
    store: Arc<dyn StatusStore>,
    queue: Arc<JobQueue>,
}

impl JobStore {
    pub fn new(store: Arc<dyn StatusStore>, queue: Arc<JobQueue>) -> Self {
        Self { store, queue }
    }

    pub fn to_checkpoint(&self, job: &Job) -> Result<String, JobError> {
        job.to_checkpoint()
    }

    pub fn from_checkpoint(&self, blob: &str) -> Result<Job, JobError> {
        Job::from_checkpoint(blob)
    }

    /// Loads the job checkpointed for `status_ref`, detached from any queue.
    /// `None` when the record has no checkpoint.
    pub fn get_job(&self, status_ref: &StatusRef) -> Result<Option<Job>, JobError> {
        match self.store.get(status_ref)? {
            Some(record) => self.job_from_record(&record),
            None => Ok(None),
        }
    }

    fn job_from_record(&self, record: &StatusRecord) -> Result<Option<Job>, JobError> {
        record
            .checkpoint
            .as_deref()
            .map(Job::from_checkpoint)
            .transpose()
    }

    /// Writes the current checkpoint of `job`, keeping its stored status.
    pub fn store_job(&self, job: &Job) -> Result<StatusRecord, JobError> {
        self.persist(job, None)
    }

    /// Writes the checkpoint of `job` and moves it to `status`, creating the
    /// record when needed.
    pub fn store_job_with_status(&self, job: &Job, status: JobStatus) -> Result<StatusRecord, JobError> {
        self.persist(job, Some(status))
    }

    fn persist(&self, job: &Job, status: Option<JobStatus>) -> Result<StatusRecord, JobError> {
        let checkpoint = job.to_checkpoint()?;
        let status_ref = StatusRef::Guid(job.guid.clone());
        let record = match self.store.get(&status_ref)? {
            Some(_) => {
                let update = StatusUpdate {
                    status,
                    ..Default::default()
                }
                .with_checkpoint(checkpoint, job.active_task_id());
                self.store.update(&status_ref, update)?
            }
            None => {
                let mut record = job.new_status_record(status.unwrap_or(JobStatus::Waiting));
                record.checkpoint = Some(checkpoint);
                self.store.insert(record)?
            }
        };
        Ok(record)
    }

    /// Puts a job back on the queue from its last checkpoint.
    ///
    /// Error and retry counters only go up when the job actually failed, so
    /// requeueing interrupted work does not inflate them.
    pub fn retry(&self, status_ref: &StatusRef) -> Result<(), JobError> {
        let record = self
            .store
            .get(status_ref)?
            .ok_or_else(|| JobError::JobNotFound(status_ref.to_string()))?;
        let mut job = self
            .job_from_record(&record)?
            .ok_or_else(|| JobError::JobNotFound(format!("checkpoint for {}", status_ref)))?;

        if self.queue.contains(&job.guid) {
            return Err(JobError::invalid_state(&job.guid, "not queued", "already queued"));
        }
        if record.status == JobStatus::Error {
            job.error_count += 1;
            job.retry_count += 1;
        }
        if record.job_guid != job.guid {
            job.previous_guid = Some(record.job_guid.clone());
        }

        info!(
            "Retrying job {} from {} (retry #{})",
            job.guid, record.status, job.retry_count
        );
        self.queue.add_job(job)
    }

    /// Requeues every interrupted or waiting job with a checkpoint, as left
    /// behind by a previous process. Returns how many jobs were queued.
    pub fn requeue_outstanding(&self) -> Result<usize, JobError> {
        let records = self.store.list(&crate::status::StatusFilter {
            statuses: vec![
                JobStatus::Waiting,
                JobStatus::Running,
                JobStatus::Interrupted,
                JobStatus::Cancelling,
            ],
            ..Default::default()
        })?;

        let mut requeued = 0;
        for record in records {
            let status_ref = StatusRef::RowId(record.row_id);
            if record.status == JobStatus::Cancelling {
                self.store
                    .update(&status_ref, StatusUpdate::status(JobStatus::Cancelled))?;
                continue;
            }
            let job = match self.job_from_record(&record) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Cannot restore job {}: {}", record.job_guid, e);
                    self.store.update(
                        &status_ref,
                        StatusUpdate {
                            had_error: Some(true),
                            ..StatusUpdate::status(JobStatus::Error)
                        }
                        .with_info(format!("Checkpoint could not be restored: {}", e)),
                    )?;
                    continue;
                }
            };
            if self.queue.contains(&job.guid) {
                continue;
            }
            self.queue.add_job(job)?;
            requeued += 1;
        }
        if requeued > 0 {
            info!("Requeued {} outstanding jobs", requeued);
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{JobExecutor, TaskStep, WorkerPool};
    use crate::status::SqliteStatusStore;
    use std::sync::{Mutex, Weak};
    use tokio_util::sync::CancellationToken;

    /// Accepts submissions and drops them, so queued jobs stay pending.
    struct ParkingPool(Mutex<usize>);

    impl WorkerPool for ParkingPool {
        fn submit(&self, _task: crate::pipeline::Runnable) {
            *self.0.lock().unwrap() += 1;
        }

        fn capacity(&self) -> usize {
            usize::MAX
        }
    }

    struct NoopExecutor;

    impl JobExecutor for NoopExecutor {
        fn execute(&self, _job: Job, _token: CancellationToken) {}
    }

    struct Harness {
        store: Arc<SqliteStatusStore>,
        queue: Arc<JobQueue>,
        job_store: JobStore,
        _executor: Arc<NoopExecutor>,
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteStatusStore::in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(store.clone(), Arc::new(ParkingPool(Mutex::new(0)))));
        let executor = Arc::new(NoopExecutor);
        let weak: Weak<dyn JobExecutor> = Arc::downgrade(&executor) as Weak<dyn JobExecutor>;
        queue.set_executor(weak);
        let job_store = JobStore::new(store.clone(), queue.clone());
        Harness {
            store,
            queue,
            job_store,
            _executor: executor,
        }
    }

    fn job() -> Job {
        Job::new("/lab", "test", vec![TaskStep::new("noop"), TaskStep::new("noop2")])
    }

    #[test]
    fn test_get_job_without_checkpoint_is_none() {
        let h = harness();
        let job = job();
        h.store
            .insert(job.new_status_record(JobStatus::Running))
            .unwrap();
        assert!(h.job_store.get_job(&StatusRef::Guid(job.guid)).unwrap().is_none());
        assert!(h.job_store.get_job(&"missing".into()).unwrap().is_none());
    }

    #[test]
    fn test_store_and_get_job() {
        let h = harness();
        let mut job = job();
        job.advance();
        job.results.push(serde_json::json!("partial"));
        h.job_store
            .store_job_with_status(&job, JobStatus::Running)
            .unwrap();

        let loaded = h.job_store.get_job(&StatusRef::Guid(job.guid.clone())).unwrap().unwrap();
        assert_eq!(loaded, job);
        let record = h.store.get(&StatusRef::Guid(job.guid)).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.active_task.as_deref(), Some("noop2"));
    }

    #[test]
    fn test_retry_missing_checkpoint_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.job_store.retry(&"missing".into()),
            Err(JobError::JobNotFound(_))
        ));

        let job = job();
        h.store
            .insert(job.new_status_record(JobStatus::Error))
            .unwrap();
        assert!(matches!(
            h.job_store.retry(&StatusRef::Guid(job.guid)),
            Err(JobError::JobNotFound(_))
        ));
    }

    #[test]
    fn test_retry_after_error_increments_counters() {
        let h = harness();
        let job = job();
        let guid = job.guid.clone();
        h.job_store
            .store_job_with_status(&job, JobStatus::Error)
            .unwrap();

        h.job_store.retry(&StatusRef::Guid(guid.clone())).unwrap();

        assert!(h.queue.contains(&guid));
        let record = h.store.get(&StatusRef::Guid(guid.clone())).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Waiting);
        let requeued = Job::from_checkpoint(record.checkpoint.as_deref().unwrap()).unwrap();
        assert_eq!(requeued.error_count, 1);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.previous_guid, None);
    }

    #[test]
    fn test_retry_of_queued_job_is_rejected() {
        let h = harness();
        let job = job();
        let guid = job.guid.clone();
        h.queue.add_job(job).unwrap();
        assert!(matches!(
            h.job_store.retry(&StatusRef::Guid(guid)),
            Err(JobError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_retry_keeps_old_guid_when_record_was_resubmitted() {
        let h = harness();
        let original = job();
        let mut resubmitted = original.clone();
        resubmitted.guid = "new-guid".to_string();

        let mut record = original.new_status_record(JobStatus::Error);
        record.checkpoint = Some(resubmitted.to_checkpoint().unwrap());
        h.store.insert(record).unwrap();

        h.job_store
            .retry(&StatusRef::Guid(original.guid.clone()))
            .unwrap();

        let record = h.store.get(&StatusRef::Guid("new-guid".into())).unwrap().unwrap();
        let requeued = Job::from_checkpoint(record.checkpoint.as_deref().unwrap()).unwrap();
        assert_eq!(requeued.previous_guid.as_deref(), Some(original.guid.as_str()));
    }

    #[test]
    fn test_requeue_outstanding_does_not_touch_counters() {
        let h = harness();
        let waiting = job();
        let interrupted = job();
        let failed = job();
        let cancelling = job();
        h.job_store.store_job_with_status(&waiting, JobStatus::Waiting).unwrap();
        h.job_store
            .store_job_with_status(&interrupted, JobStatus::Interrupted)
            .unwrap();
        h.job_store.store_job_with_status(&failed, JobStatus::Error).unwrap();
        h.job_store
            .store_job_with_status(&cancelling, JobStatus::Cancelling)
            .unwrap();

        assert_eq!(h.job_store.requeue_outstanding().unwrap(), 2);

        assert!(h.queue.contains(&waiting.guid));
        assert!(h.queue.contains(&interrupted.guid));
        assert!(!h.queue.contains(&failed.guid));
        let requeued = h
            .job_store
            .get_job(&StatusRef::Guid(interrupted.guid.clone()))
            .unwrap()
            .unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.error_count, 0);
        let cancelled = h.store.get(&StatusRef::Guid(cancelling.guid)).unwrap().unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_requeue_marks_unreadable_checkpoint_as_error() {
        let h = harness();
        let job = job();
        let mut record = job.new_status_record(JobStatus::Running);
        record.checkpoint = Some("{broken".to_string());
        h.store.insert(record).unwrap();

        assert_eq!(h.job_store.requeue_outstanding().unwrap(), 0);
        let record = h.store.get(&StatusRef::Guid(job.guid)).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert!(record.had_error);
    }
}
