//! In-memory admission control.
//!
//! The queue owns the pending and running sets and decides which pending
//! jobs may start. A job is dispatched only when no other in-flight job
//! shares its container, and a job that disallows simultaneous execution
//! additionally waits until no other such job is in flight. Every `done`
//! triggers another dispatch pass, which is what eventually unblocks the
//! jobs that were skipped.

use super::error::JobError;
use super::job::Job;
use super::worker_pool::WorkerPool;
use crate::metrics;
use crate::status::{JobStatus, StatusRef, StatusStore, StatusUpdate};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runs a job handed over by the queue.
///
/// Implementations must call [`JobQueue::starting`] before doing any work
/// and [`JobQueue::done`] once the job leaves the worker, whatever the
/// outcome.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, job: Job, cancellation_token: CancellationToken);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePosition {
    Pending,
    /// Handed to the worker pool, not yet started.
    Submitted,
    Running,
}

/// Diagnostic snapshot of a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueuedJobInfo {
    pub guid: String,
    pub parent_guid: Option<String>,
    pub container_id: String,
    pub provider: String,
    pub description: Option<String>,
    pub log_file: Option<String>,
    pub data_url: Option<String>,
    pub allow_multiple_simultaneous_jobs: bool,
    pub position: QueuePosition,
}

impl QueuedJobInfo {
    fn from_job(job: &Job) -> Self {
        Self {
            guid: job.guid.clone(),
            parent_guid: job.parent_guid.clone(),
            container_id: job.container_id.clone(),
            provider: job.provider.clone(),
            description: job.description.clone(),
            log_file: job.log_file.clone(),
            data_url: job.data_url.clone(),
            allow_multiple_simultaneous_jobs: job.allow_multiple_simultaneous_jobs,
            position: QueuePosition::Pending,
        }
    }
}

/// Result of [`JobQueue::cancel_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job never started and is gone from the queue.
    Removed,
    /// The job is submitted or running; it was asked to stop and leaves the
    /// queue through `done`.
    Signalled,
    NotFound,
}

struct QueueEntry {
    info: QueuedJobInfo,
    token: CancellationToken,
    /// Taken when the job is handed to the pool.
    job: Option<Job>,
}

#[derive(Default)]
struct QueueState {
    pending: IndexMap<String, QueueEntry>,
    running: IndexMap<String, QueueEntry>,
}

impl QueueState {
    fn in_flight(&self) -> impl Iterator<Item = &QueueEntry> {
        self.pending
            .values()
            .filter(|entry| entry.info.position == QueuePosition::Submitted)
            .chain(self.running.values())
    }

    fn all(&self) -> impl Iterator<Item = &QueueEntry> {
        self.pending.values().chain(self.running.values())
    }
}

pub struct JobQueue {
    id: String,
    store: Arc<dyn StatusStore>,
    pool: Arc<dyn WorkerPool>,
    state: Mutex<QueueState>,
    executor: RwLock<Option<Weak<dyn JobExecutor>>>,
    shutdown_token: CancellationToken,
}

impl JobQueue {
    pub fn new(store: Arc<dyn StatusStore>, pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            store,
            pool,
            state: Mutex::new(QueueState::default()),
            executor: RwLock::new(None),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wires the executor jobs are handed to. Held weakly since the executor
    /// itself keeps the queue alive.
    pub fn set_executor(&self, executor: Weak<dyn JobExecutor>) {
        *self.executor.write().unwrap() = Some(executor);
    }

    fn executor(&self) -> Option<Arc<dyn JobExecutor>> {
        self.executor.read().unwrap().as_ref().and_then(Weak::upgrade)
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    /// Stops dispatching and interrupts every running job.
    pub fn shutdown(&self) {
        info!("Shutting down job queue {}", self.id);
        self.shutdown_token.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Persists `job` as WAITING, appends it to the pending set and runs a
    /// dispatch pass.
    pub fn add_job(&self, mut job: Job) -> Result<(), JobError> {
        {
            let state = self.state.lock().unwrap();
            if state.pending.contains_key(&job.guid) || state.running.contains_key(&job.guid) {
                return Err(JobError::invalid_state(&job.guid, "not queued", "already queued"));
            }
        }

        let checkpoint = job.to_checkpoint()?;
        let status_ref = StatusRef::Guid(job.guid.clone());
        match self.store.get(&status_ref)? {
            None => {
                let mut record = job.new_status_record(JobStatus::Waiting);
                record.checkpoint = Some(checkpoint);
                self.store.insert(record)?;
            }
            Some(_) => {
                let update = StatusUpdate {
                    status: Some(JobStatus::Waiting),
                    parent_guid: job.parent_guid.clone(),
                    provider: Some(job.provider.clone()),
                    description: job.description.clone(),
                    email: job.owner_email.clone(),
                    data_url: job.data_url.clone(),
                    file_path: job.log_file.clone(),
                    ..Default::default()
                }
                .with_checkpoint(checkpoint, job.active_task_id());
                self.store.update(&status_ref, update)?;
            }
        }

        job.bind(&self.id);
        debug!("Queued job {} in container {}", job.guid, job.container_id);
        {
            let mut state = self.state.lock().unwrap();
            let entry = QueueEntry {
                info: QueuedJobInfo::from_job(&job),
                token: self.shutdown_token.child_token(),
                job: Some(job),
            };
            state.pending.insert(entry.info.guid.clone(), entry);
        }
        metrics::record_job_queued();

        self.submit_jobs();
        Ok(())
    }

    /// Moves a submitted job from pending to running. Returns `false` when
    /// the job was cancelled before it got here and should not run.
    pub fn starting(&self, guid: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(mut entry) = state.pending.shift_remove(guid) else {
            warn!("Job {} started without being submitted", guid);
            return false;
        };
        entry.info.position = QueuePosition::Running;
        let proceed = !entry.token.is_cancelled();
        state.running.insert(guid.to_string(), entry);
        metrics::set_jobs_running(state.running.len());
        proceed
    }

    /// Forgets a finished job and dispatches whatever it was blocking.
    pub fn done(&self, guid: &str) {
        {
            let mut state = self.state.lock().unwrap();
            let removed = state.running.shift_remove(guid).is_some()
                | state.pending.shift_remove(guid).is_some();
            if !removed {
                debug!("Job {} was not in the queue when done", guid);
            }
            metrics::set_jobs_running(state.running.len());
        }
        self.submit_jobs();
    }

    /// Withdraws jobs whose records were rolled back. Pending and submitted
    /// entries are dropped and running ones are signalled; a submitted job
    /// then fails `starting` and is never run. No dispatch pass runs here,
    /// the caller may still be inside the transaction being rolled back.
    /// Returns how many entries were dropped.
    pub(crate) fn discard(&self, guids: &[String]) -> usize {
        let mut state = self.state.lock().unwrap();
        let mut removed = 0;
        for guid in guids {
            if let Some(entry) = state.pending.shift_remove(guid) {
                entry.token.cancel();
                removed += 1;
            } else if let Some(entry) = state.running.get(guid) {
                entry.token.cancel();
            }
        }
        debug!("Discarded {} queued jobs from queue {}", removed, self.id);
        removed
    }

    /// One dispatch pass over the pending set, in FIFO order.
    fn submit_jobs(&self) {
        if self.is_shut_down() {
            return;
        }
        let Some(executor) = self.executor() else {
            warn!("Job queue {} has no executor, nothing dispatched", self.id);
            return;
        };

        let mut to_submit = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let mut occupied: HashSet<String> = state
                .in_flight()
                .map(|entry| entry.info.container_id.clone())
                .collect();
            let mut single_threaded_in_flight = state
                .in_flight()
                .any(|entry| !entry.info.allow_multiple_simultaneous_jobs);

            for entry in state.pending.values_mut() {
                if entry.info.position != QueuePosition::Pending {
                    continue;
                }
                let single_threaded = !entry.info.allow_multiple_simultaneous_jobs;
                if single_threaded && single_threaded_in_flight {
                    continue;
                }
                if occupied.contains(&entry.info.container_id) {
                    continue;
                }
                let Some(job) = entry.job.take() else {
                    continue;
                };
                entry.info.position = QueuePosition::Submitted;
                occupied.insert(entry.info.container_id.clone());
                single_threaded_in_flight |= single_threaded;
                to_submit.push((job, entry.token.clone()));
            }
        }

        for (job, token) in to_submit {
            debug!("Submitting job {} to worker pool", job.guid);
            let executor = Arc::clone(&executor);
            self.pool
                .submit(Box::new(move || executor.execute(job, token)));
        }
    }

    /// Cancels a job in `container_id`.
    ///
    /// A job that has not been handed to the pool yet is removed and marked
    /// CANCELLED. A submitted or running job only gets its cancellation token
    /// triggered and is marked CANCELLING; it leaves the queue later through
    /// `done`.
    pub fn cancel_job(&self, container_id: &str, status_ref: &StatusRef) -> Result<CancelOutcome, JobError> {
        let guid = match status_ref {
            StatusRef::Guid(guid) => guid.clone(),
            StatusRef::RowId(_) => match self.store.get(status_ref)? {
                Some(record) => record.job_guid,
                None => return Ok(CancelOutcome::NotFound),
            },
        };

        // held until the status is written so the runner's final status lands after it
        let tx = self.store.begin()?;
        let outcome = {
            let mut state = self.state.lock().unwrap();
            let pending_position = state
                .pending
                .get(&guid)
                .filter(|entry| entry.info.container_id == container_id)
                .map(|entry| entry.info.position);
            match pending_position {
                Some(QueuePosition::Pending) => {
                    state.pending.shift_remove(&guid);
                    CancelOutcome::Removed
                }
                Some(_) => {
                    if let Some(entry) = state.pending.get(&guid) {
                        entry.token.cancel();
                    }
                    CancelOutcome::Signalled
                }
                None => match state
                    .running
                    .get(&guid)
                    .filter(|entry| entry.info.container_id == container_id)
                {
                    Some(entry) => {
                        entry.token.cancel();
                        CancelOutcome::Signalled
                    }
                    None => CancelOutcome::NotFound,
                },
            }
        };

        let status = match outcome {
            CancelOutcome::Removed => JobStatus::Cancelled,
            CancelOutcome::Signalled => JobStatus::Cancelling,
            CancelOutcome::NotFound => {
                tx.commit()?;
                return Ok(outcome);
            }
        };
        info!("Cancel requested for job {}: {:?}", guid, outcome);
        let status_ref = StatusRef::Guid(guid);
        // the runner may already have recorded a final status
        let still_queued = self
            .store
            .get(&status_ref)?
            .is_some_and(|record| matches!(record.status, JobStatus::Waiting | JobStatus::Running));
        if still_queued {
            self.store.update(&status_ref, StatusUpdate::status(status))?;
            if status == JobStatus::Cancelled {
                metrics::record_job_finished(status);
            }
        }
        tx.commit()?;
        Ok(outcome)
    }

    /// Queued jobs whose log file or data location starts with `location`.
    pub fn find_jobs(&self, location: &str) -> Vec<QueuedJobInfo> {
        let state = self.state.lock().unwrap();
        state
            .all()
            .filter(|entry| {
                [&entry.info.log_file, &entry.info.data_url]
                    .iter()
                    .any(|path| path.as_deref().is_some_and(|p| p.starts_with(location)))
            })
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Snapshot of pending and running jobs, optionally for one container.
    pub fn get_job_data_in_memory(&self, container_id: Option<&str>) -> Vec<QueuedJobInfo> {
        let state = self.state.lock().unwrap();
        state
            .all()
            .filter(|entry| container_id.map_or(true, |c| entry.info.container_id == c))
            .map(|entry| entry.info.clone())
            .collect()
    }

    pub fn contains(&self, guid: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.contains_key(guid) || state.running.contains_key(guid)
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.pending.is_empty() && state.running.is_empty()
    }

    /// True when nothing is submitted or running. Pending jobs that were
    /// never handed to the pool do not count, they stay put after shutdown.
    pub fn is_quiescent(&self) -> bool {
        let state = self.state.lock().unwrap();
        let idle = state.in_flight().next().is_none();
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{InlinePool, Runnable, TaskStep};
    use crate::status::SqliteStatusStore;

    /// Pool that parks submissions until the test releases them.
    #[derive(Default)]
    struct ManualPool {
        parked: Mutex<Vec<Runnable>>,
    }

    impl ManualPool {
        fn run_next(&self) -> bool {
            let task = {
                let mut parked = self.parked.lock().unwrap();
                if parked.is_empty() {
                    return false;
                }
                parked.remove(0)
            };
            task();
            true
        }

        fn parked(&self) -> usize {
            self.parked.lock().unwrap().len()
        }
    }

    impl WorkerPool for ManualPool {
        fn submit(&self, task: Runnable) {
            self.parked.lock().unwrap().push(task);
        }

        fn capacity(&self) -> usize {
            usize::MAX
        }
    }

    /// Executor that marks jobs started and records them, leaving `done` to
    /// the test.
    struct RecordingExecutor {
        queue: Weak<JobQueue>,
        started: Mutex<Vec<String>>,
    }

    impl JobExecutor for RecordingExecutor {
        fn execute(&self, job: Job, _token: CancellationToken) {
            if let Some(queue) = self.queue.upgrade() {
                queue.starting(&job.guid);
            }
            self.started.lock().unwrap().push(job.guid);
        }
    }

    struct Harness {
        queue: Arc<JobQueue>,
        pool: Arc<ManualPool>,
        executor: Arc<RecordingExecutor>,
        store: Arc<SqliteStatusStore>,
    }

    fn harness() -> Harness {
        let store = Arc::new(SqliteStatusStore::in_memory().unwrap());
        let pool = Arc::new(ManualPool::default());
        let queue = Arc::new(JobQueue::new(store.clone(), pool.clone()));
        let executor = Arc::new(RecordingExecutor {
            queue: Arc::downgrade(&queue),
            started: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn JobExecutor> = Arc::downgrade(&executor) as Weak<dyn JobExecutor>;
        queue.set_executor(weak);
        Harness {
            queue,
            pool,
            executor,
            store,
        }
    }

    fn job(container: &str) -> Job {
        Job::new(container, "test", vec![TaskStep::new("noop")])
    }

    fn started(h: &Harness) -> Vec<String> {
        h.executor.started.lock().unwrap().clone()
    }

    #[test]
    fn test_add_job_persists_waiting_record_with_checkpoint() {
        let h = harness();
        let job = job("/a").with_owner_email("me@example.com");
        let guid = job.guid.clone();
        h.queue.add_job(job).unwrap();

        let record = h.store.get(&StatusRef::Guid(guid.clone())).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Waiting);
        assert_eq!(record.email.as_deref(), Some("me@example.com"));
        assert_eq!(record.active_task.as_deref(), Some("noop"));
        let restored = Job::from_checkpoint(record.checkpoint.as_deref().unwrap()).unwrap();
        assert_eq!(restored.guid, guid);
        assert_eq!(restored.bound_queue(), None);
    }

    #[test]
    fn test_same_container_runs_one_at_a_time() {
        let h = harness();
        let first = job("/a");
        let second = job("/a");
        let other = job("/b");
        let (first_guid, second_guid, other_guid) =
            (first.guid.clone(), second.guid.clone(), other.guid.clone());

        h.queue.add_job(first).unwrap();
        h.queue.add_job(second).unwrap();
        h.queue.add_job(other).unwrap();
        assert_eq!(h.pool.parked(), 2);

        while h.pool.run_next() {}
        assert_eq!(started(&h), vec![first_guid.clone(), other_guid]);

        h.queue.done(&first_guid);
        assert_eq!(h.pool.parked(), 1);
        h.pool.run_next();
        assert_eq!(started(&h).last(), Some(&second_guid));
    }

    #[test]
    fn test_single_threaded_jobs_wait_for_each_other_across_containers() {
        let h = harness();
        let a = job("/x").single_threaded();
        let b = job("/y").single_threaded();
        let c = job("/z");
        let (a_guid, b_guid, c_guid) = (a.guid.clone(), b.guid.clone(), c.guid.clone());

        h.queue.add_job(a).unwrap();
        h.queue.add_job(b).unwrap();
        h.queue.add_job(c).unwrap();
        while h.pool.run_next() {}

        assert_eq!(started(&h), vec![a_guid.clone(), c_guid]);
        let pending: Vec<_> = h
            .queue
            .get_job_data_in_memory(Some("/y"))
            .into_iter()
            .map(|info| (info.guid, info.position))
            .collect();
        assert_eq!(pending, vec![(b_guid.clone(), QueuePosition::Pending)]);

        h.queue.done(&a_guid);
        while h.pool.run_next() {}
        assert_eq!(started(&h).last(), Some(&b_guid));
    }

    #[test]
    fn test_cancel_pending_job_removes_it() {
        let h = harness();
        let blocker = job("/a");
        let waiting = job("/a");
        let waiting_guid = waiting.guid.clone();
        h.queue.add_job(blocker).unwrap();
        h.queue.add_job(waiting).unwrap();

        let outcome = h
            .queue
            .cancel_job("/a", &StatusRef::Guid(waiting_guid.clone()))
            .unwrap();
        assert_eq!(outcome, CancelOutcome::Removed);
        assert!(!h.queue.contains(&waiting_guid));
        let record = h.store.get(&StatusRef::Guid(waiting_guid)).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_cancel_running_job_only_signals() {
        let h = harness();
        let running = job("/a");
        let guid = running.guid.clone();
        h.queue.add_job(running).unwrap();
        h.pool.run_next();

        let record = h.store.get(&StatusRef::Guid(guid.clone())).unwrap().unwrap();
        let outcome = h
            .queue
            .cancel_job("/a", &StatusRef::RowId(record.row_id))
            .unwrap();
        assert_eq!(outcome, CancelOutcome::Signalled);
        assert!(h.queue.contains(&guid));
        let record = h.store.get(&StatusRef::Guid(guid.clone())).unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Cancelling);

        h.queue.done(&guid);
        assert!(!h.queue.contains(&guid));
    }

    #[test]
    fn test_cancel_in_wrong_container_is_not_found() {
        let h = harness();
        let job = job("/a");
        let guid = job.guid.clone();
        h.queue.add_job(job).unwrap();

        let outcome = h.queue.cancel_job("/b", &StatusRef::Guid(guid)).unwrap();
        assert_eq!(outcome, CancelOutcome::NotFound);
    }

    #[test]
    fn test_submitted_job_cancelled_before_start_does_not_proceed() {
        let h = harness();
        let job = job("/a");
        let guid = job.guid.clone();
        h.queue.add_job(job).unwrap();

        assert_eq!(
            h.queue.cancel_job("/a", &StatusRef::Guid(guid.clone())).unwrap(),
            CancelOutcome::Signalled
        );
        assert!(!h.queue.starting(&guid));
    }

    #[test]
    fn test_find_jobs_by_location() {
        let h = harness();
        h.queue
            .add_job(job("/a").with_log_file("/data/a/run.log"))
            .unwrap();
        h.queue
            .add_job(job("/b").with_log_file("/data/b/run.log"))
            .unwrap();

        let found = h.queue.find_jobs("/data/a");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].container_id, "/a");
        assert_eq!(h.queue.find_jobs("/data").len(), 2);
        assert!(h.queue.find_jobs("/elsewhere").is_empty());
    }

    #[test]
    fn test_add_same_job_twice_is_rejected() {
        let h = harness();
        let job = job("/a");
        h.queue.add_job(job.clone()).unwrap();
        assert!(matches!(
            h.queue.add_job(job),
            Err(JobError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_shutdown_stops_dispatch() {
        let h = harness();
        h.queue.shutdown();
        h.queue.add_job(job("/a")).unwrap();
        assert_eq!(h.pool.parked(), 0);
        assert!(!h.queue.is_idle());
    }

    #[test]
    fn test_pending_jobs_do_not_hold_up_quiescence() {
        let h = harness();
        let first = job("/a");
        let first_guid = first.guid.clone();
        h.queue.add_job(first).unwrap();
        h.queue.add_job(job("/a")).unwrap();
        assert!(!h.queue.is_quiescent());

        h.queue.shutdown();
        assert!(h.pool.run_next());
        assert_eq!(started(&h), vec![first_guid.clone()]);
        assert!(!h.queue.is_quiescent());
        h.queue.done(&first_guid);
        assert_eq!(h.pool.parked(), 0);
        assert!(h.queue.is_quiescent());
        assert!(!h.queue.is_idle());
    }

    #[test]
    fn test_discard_withdraws_pending_and_submitted_jobs() {
        let h = harness();
        let submitted = job("/a");
        let pending = job("/a");
        let other = job("/b");
        let guids = vec![submitted.guid.clone(), pending.guid.clone()];
        h.queue.add_job(submitted).unwrap();
        h.queue.add_job(pending).unwrap();
        h.queue.add_job(other.clone()).unwrap();

        assert_eq!(h.queue.discard(&guids), 2);
        assert!(!h.queue.contains(&guids[0]));
        assert!(!h.queue.contains(&guids[1]));
        assert!(h.queue.contains(&other.guid));
        assert!(!h.queue.starting(&guids[0]));
        assert!(h.queue.starting(&other.guid));
    }

    #[test]
    fn test_inline_pool_runs_jobs_during_add() {
        let store = Arc::new(SqliteStatusStore::in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(store, Arc::new(InlinePool)));
        let executor = Arc::new(RecordingExecutor {
            queue: Arc::downgrade(&queue),
            started: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn JobExecutor> = Arc::downgrade(&executor) as Weak<dyn JobExecutor>;
        queue.set_executor(weak);

        let job = job("/a");
        let guid = job.guid.clone();
        queue.add_job(job).unwrap();
        assert_eq!(executor.started.lock().unwrap().clone(), vec![guid]);
    }
}
