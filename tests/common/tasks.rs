//! Tasks with observable timing, for driving the queue from tests.

use pipeline_server::pipeline::{Job, JobError, PipelineTask, TaskContext, TaskRegistry};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Blocks every job until the gate opens. Records the container of each job
/// when it starts.
#[derive(Default)]
pub struct GateTask {
    open: AtomicBool,
    started: Mutex<Vec<String>>,
}

impl GateTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn registry(self: &Arc<Self>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register(self.clone());
        registry
    }
}

impl PipelineTask for GateTask {
    fn id(&self) -> &'static str {
        "gate"
    }

    fn description(&self) -> &'static str {
        "Waits until the test opens the gate"
    }

    fn execute(&self, ctx: &TaskContext, job: &mut Job) -> Result<(), JobError> {
        self.started.lock().unwrap().push(job.container_id.clone());
        while !self.open.load(Ordering::SeqCst) {
            ctx.check_cancelled()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        job.results.push(json!({ "gate": job.container_id }));
        Ok(())
    }
}

/// Fails the first `failures` runs, then succeeds.
pub struct FlakyTask {
    failures_left: AtomicUsize,
}

impl FlakyTask {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(failures),
        })
    }
}

impl PipelineTask for FlakyTask {
    fn id(&self) -> &'static str {
        "flaky"
    }

    fn description(&self) -> &'static str {
        "Fails a fixed number of times"
    }

    fn execute(&self, _ctx: &TaskContext, job: &mut Job) -> Result<(), JobError> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(JobError::ExecutionFailed("transient failure".to_string()));
        }
        job.results.push(json!({ "flaky": "ok" }));
        Ok(())
    }
}

/// Measures how many jobs run at once, per container and overall.
#[derive(Default)]
pub struct TrackingTask {
    active: Mutex<HashMap<String, usize>>,
    max_per_container: AtomicUsize,
    active_total: AtomicUsize,
    max_total: AtomicUsize,
}

impl TrackingTask {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn max_per_container(&self) -> usize {
        self.max_per_container.load(Ordering::SeqCst)
    }

    pub fn max_total(&self) -> usize {
        self.max_total.load(Ordering::SeqCst)
    }
}

impl PipelineTask for TrackingTask {
    fn id(&self) -> &'static str {
        "track"
    }

    fn description(&self) -> &'static str {
        "Records concurrency while sleeping briefly"
    }

    fn execute(&self, _ctx: &TaskContext, job: &mut Job) -> Result<(), JobError> {
        {
            let mut active = self.active.lock().unwrap();
            let count = active.entry(job.container_id.clone()).or_insert(0);
            *count += 1;
            self.max_per_container.fetch_max(*count, Ordering::SeqCst);
        }
        let total = self.active_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_total.fetch_max(total, Ordering::SeqCst);

        std::thread::sleep(Duration::from_millis(20));

        self.active_total.fetch_sub(1, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap();
        if let Some(count) = active.get_mut(&job.container_id) {
            *count -= 1;
        }
        Ok(())
    }
}
