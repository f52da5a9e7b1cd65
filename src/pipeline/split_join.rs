//! Fan-out of a job into per-input children and fan-in of their results.
//!
//! Both operations run under one process-wide reentrant lock and a store
//! transaction, so the parent row, the child rows and the remaining-children
//! count are always changed together. A split that fails after queueing
//! some children takes them back out of the queue. While `split` queues
//! children, a thread-local [`SplitRecord`] lets a child that finishes on
//! the same thread join through memory instead of the store.

use super::error::JobError;
use super::job::Job;
use super::job_store::JobStore;
use super::queue::JobQueue;
use crate::metrics;
use crate::status::{JobStatus, StatusRef, StatusStore, StatusUpdate};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A parent and the children it is still waiting for, scoped to one
/// `split` call on one thread.
#[derive(Debug)]
pub struct SplitRecord {
    pub parent: Job,
    pub remaining: HashSet<String>,
}

thread_local! {
    static SPLIT_RECORDS: RefCell<Vec<SplitRecord>> = const { RefCell::new(Vec::new()) };
}

/// Pops the record pushed by `enter` when dropped, unless `finish` took it.
struct SplitScope {
    active: bool,
}

impl SplitScope {
    fn enter(record: SplitRecord) -> Self {
        SPLIT_RECORDS.with(|records| records.borrow_mut().push(record));
        Self { active: true }
    }

    fn finish(mut self) -> Option<SplitRecord> {
        self.active = false;
        SPLIT_RECORDS.with(|records| records.borrow_mut().pop())
    }
}

impl Drop for SplitScope {
    fn drop(&mut self) {
        if self.active {
            SPLIT_RECORDS.with(|records| records.borrow_mut().pop());
        }
    }
}

/// Children a split put in the queue. Dropped before `keep`, it takes them
/// back out so a rolled back split leaves nothing runnable behind.
struct QueuedChildren<'a> {
    queue: &'a JobQueue,
    guids: Vec<String>,
}

impl QueuedChildren<'_> {
    fn keep(mut self) {
        self.guids.clear();
    }
}

impl Drop for QueuedChildren<'_> {
    fn drop(&mut self) {
        if !self.guids.is_empty() {
            let removed = self.queue.discard(&self.guids);
            warn!("Split rolled back, withdrew {} queued children", removed);
        }
    }
}

/// Children still outstanding for `parent_guid` in a split running on this
/// thread, if any.
pub fn split_in_progress(parent_guid: &str) -> Option<usize> {
    SPLIT_RECORDS.with(|records| {
        records
            .borrow()
            .iter()
            .rev()
            .find(|record| record.parent.guid == parent_guid)
            .map(|record| record.remaining.len())
    })
}

#[derive(Debug)]
pub enum SplitOutcome {
    /// Every child already finished; the parent moved past the split step
    /// and should keep running.
    Proceed(Job),
    /// The parent is persisted as SPLIT until its children join.
    Waiting { remaining: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Joined into a split still running on this thread.
    Nested { remaining: usize },
    /// Other children are still outstanding.
    Waiting { remaining: usize },
    /// Last child joined and the parent was queued for its next step.
    Resumed,
    /// Last child joined and the parent had no steps left.
    Completed,
}

pub struct SplitJoinCoordinator {
    lock: ReentrantMutex<()>,
    store: Arc<dyn StatusStore>,
    job_store: Arc<JobStore>,
    queue: Arc<JobQueue>,
}

impl SplitJoinCoordinator {
    pub fn new(store: Arc<dyn StatusStore>, job_store: Arc<JobStore>, queue: Arc<JobQueue>) -> Self {
        Self {
            lock: ReentrantMutex::new(()),
            store,
            job_store,
            queue,
        }
    }

    /// Fans `job` out into one child per input and queues them.
    pub fn split(&self, job: Job) -> Result<SplitOutcome, JobError> {
        let _guard = self.lock.lock();
        let tx = self.store.begin()?;

        let status_ref = StatusRef::Guid(job.guid.clone());
        if self.store.get(&status_ref)?.is_none() {
            self.job_store
                .store_job_with_status(&job, JobStatus::Running)?;
        }

        let children = job.create_split_jobs()?;
        info!("Splitting job {} into {} children", job.guid, children.len());
        metrics::record_split(children.len());

        let scope = SplitScope::enter(SplitRecord {
            remaining: children.iter().map(|child| child.guid.clone()).collect(),
            parent: job,
        });
        let mut queued = QueuedChildren {
            queue: self.queue.as_ref(),
            guids: Vec::with_capacity(children.len()),
        };
        for child in children {
            queued.guids.push(child.guid.clone());
            self.queue.add_job(child)?;
        }
        let record = scope.finish().ok_or_else(|| {
            JobError::invalid_state(&status_ref.to_string(), "split record", "none")
        })?;

        let remaining = record.remaining.len();
        let mut parent = record.parent;
        if remaining > 0 {
            self.job_store
                .store_job_with_status(&parent, JobStatus::Split)?;
            tx.commit()?;
            queued.keep();
            debug!("Job {} waits for {} children", parent.guid, remaining);
            return Ok(SplitOutcome::Waiting { remaining });
        }

        parent.advance();
        self.job_store.store_job(&parent)?;
        tx.commit()?;
        queued.keep();
        Ok(SplitOutcome::Proceed(parent))
    }

    /// Folds a finished child back into its parent.
    pub fn join(&self, child: &Job) -> Result<JoinOutcome, JobError> {
        let parent_guid = child
            .parent_guid
            .clone()
            .ok_or_else(|| JobError::invalid_state(&child.guid, "split child", "top-level job"))?;

        let _guard = self.lock.lock();
        let tx = self.store.begin()?;

        let nested = SPLIT_RECORDS.with(|records| {
            let mut records = records.borrow_mut();
            records
                .iter_mut()
                .rev()
                .find(|record| record.parent.guid == parent_guid)
                .map(|record| {
                    record.remaining.remove(&child.guid);
                    record.parent.merge_split_job(child);
                    record.remaining.len()
                })
        });
        if let Some(remaining) = nested {
            self.mark_complete(child)?;
            tx.commit()?;
            metrics::record_join("nested");
            debug!("Child {} joined in-flight split of {}", child.guid, parent_guid);
            return Ok(JoinOutcome::Nested { remaining });
        }

        let parent_ref = StatusRef::Guid(parent_guid.clone());
        let record = self
            .store
            .get(&parent_ref)?
            .ok_or_else(|| JobError::JobNotFound(parent_guid.clone()))?;
        let mut parent = self
            .job_store
            .get_job(&parent_ref)?
            .ok_or_else(|| JobError::JobNotFound(parent_guid.clone()))?;
        if record.status != JobStatus::Split {
            return Err(JobError::invalid_state(
                &parent_guid,
                JobStatus::Split.as_str(),
                record.status.as_str(),
            ));
        }

        self.mark_complete(child)?;
        parent.merge_split_job(child);
        let remaining = self
            .store
            .count_incomplete_children(&parent.guid, &parent.container_id)?;

        let outcome = if remaining > 0 {
            self.job_store.store_job(&parent)?;
            JoinOutcome::Waiting { remaining }
        } else if parent.advance() {
            info!("All children of {} joined, resuming", parent.guid);
            self.queue.add_job(parent)?;
            JoinOutcome::Resumed
        } else {
            info!("All children of {} joined, job complete", parent.guid);
            self.store
                .update(&parent_ref, StatusUpdate::status(JobStatus::Complete))?;
            metrics::record_job_finished(JobStatus::Complete);
            JoinOutcome::Completed
        };
        tx.commit()?;
        metrics::record_join(match outcome {
            JoinOutcome::Waiting { .. } => "waiting",
            JoinOutcome::Resumed => "resumed",
            _ => "completed",
        });
        Ok(outcome)
    }

    fn mark_complete(&self, child: &Job) -> Result<(), JobError> {
        let child_ref = StatusRef::Guid(child.guid.clone());
        if self.store.get(&child_ref)?.is_none() {
            self.store
                .insert(child.new_status_record(JobStatus::Complete))?;
        } else {
            self.store
                .update(&child_ref, StatusUpdate::status(JobStatus::Complete))?;
        }
        metrics::record_job_finished(JobStatus::Complete);
        Ok(())
    }
}
