use super::error::JobError;
use crate::status::{JobStatus, NewStatusRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

const CHECKPOINT_VERSION: u32 = 1;

/// One step of a job: the registered task to run and whether the step fans
/// out into one child job per input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStep {
    pub task_id: String,
    #[serde(default)]
    pub split: bool,
}

impl TaskStep {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            split: false,
        }
    }

    pub fn split(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            split: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn first_step() -> Option<usize> {
    Some(0)
}

fn new_guid() -> String {
    Uuid::new_v4().to_string()
}

/// A unit of pipeline work.
///
/// Everything except the queue binding is captured by the checkpoint, so a
/// job can be suspended, persisted and resumed in another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(default = "new_guid")]
    pub guid: String,
    #[serde(default)]
    pub parent_guid: Option<String>,
    pub container_id: String,
    pub provider: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner_email: Option<String>,
    #[serde(default = "default_true")]
    pub allow_multiple_simultaneous_jobs: bool,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub data_url: Option<String>,
    pub steps: Vec<TaskStep>,
    #[serde(default = "first_step")]
    pub active_step: Option<usize>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub previous_guid: Option<String>,
    #[serde(skip)]
    bound_queue: Option<String>,
}

#[derive(Serialize)]
struct CheckpointRef<'a> {
    version: u32,
    job: &'a Job,
}

#[derive(Deserialize)]
struct Checkpoint {
    version: u32,
    job: Job,
}

impl Job {
    pub fn new(container_id: impl Into<String>, provider: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        let active_step = if steps.is_empty() { None } else { Some(0) };
        Self {
            guid: new_guid(),
            parent_guid: None,
            container_id: container_id.into(),
            provider: provider.into(),
            description: None,
            owner_email: None,
            allow_multiple_simultaneous_jobs: true,
            log_file: None,
            data_url: None,
            steps,
            active_step,
            parameters: Map::new(),
            inputs: Vec::new(),
            results: Vec::new(),
            error_count: 0,
            retry_count: 0,
            previous_guid: None,
            bound_queue: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_owner_email(mut self, email: impl Into<String>) -> Self {
        self.owner_email = Some(email.into());
        self
    }

    pub fn with_inputs(mut self, inputs: Vec<String>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_log_file(mut self, log_file: impl Into<String>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    pub fn single_threaded(mut self) -> Self {
        self.allow_multiple_simultaneous_jobs = false;
        self
    }

    pub fn is_split_child(&self) -> bool {
        self.parent_guid.is_some()
    }

    pub fn active_task(&self) -> Option<&TaskStep> {
        self.active_step.and_then(|index| self.steps.get(index))
    }

    pub fn active_task_id(&self) -> Option<String> {
        self.active_task().map(|step| step.task_id.clone())
    }

    /// Moves past the active step. Returns whether another step remains.
    pub fn advance(&mut self) -> bool {
        let next = self.active_step.map_or(self.steps.len(), |index| index + 1);
        if next < self.steps.len() {
            self.active_step = Some(next);
            true
        } else {
            self.active_step = None;
            false
        }
    }

    /// Builds one child per input for the active split step.
    ///
    /// Each child gets a fresh GUID, points back at this job, and carries only
    /// the split step so it completes as soon as that step is done.
    pub fn create_split_jobs(&self) -> Result<Vec<Job>, JobError> {
        let step = match self.active_task() {
            Some(step) if step.split => step.clone(),
            Some(step) => {
                return Err(JobError::invalid_state(
                    &self.guid,
                    "split step",
                    step.task_id.clone(),
                ))
            }
            None => return Err(JobError::invalid_state(&self.guid, "split step", "no step")),
        };

        let children = self
            .inputs
            .iter()
            .map(|input| {
                let mut child = Job::new(&self.container_id, &self.provider, vec![step.clone()]);
                child.parent_guid = Some(self.guid.clone());
                child.description = Some(match &self.description {
                    Some(description) => format!("{} ({})", description, input),
                    None => input.clone(),
                });
                child.owner_email = self.owner_email.clone();
                child.allow_multiple_simultaneous_jobs = self.allow_multiple_simultaneous_jobs;
                child.log_file = self.log_file.clone();
                child.data_url = self.data_url.clone();
                child.parameters = self.parameters.clone();
                child.inputs = vec![input.clone()];
                child
            })
            .collect();
        Ok(children)
    }

    pub fn merge_split_job(&mut self, child: &Job) {
        self.results.extend(child.results.iter().cloned());
    }

    pub fn bound_queue(&self) -> Option<&str> {
        self.bound_queue.as_deref()
    }

    pub(crate) fn bind(&mut self, queue_id: &str) {
        self.bound_queue = Some(queue_id.to_string());
    }

    pub fn to_checkpoint(&self) -> Result<String, JobError> {
        Ok(serde_json::to_string(&CheckpointRef {
            version: CHECKPOINT_VERSION,
            job: self,
        })?)
    }

    /// Rehydrates a job. The result is never bound to a queue.
    pub fn from_checkpoint(blob: &str) -> Result<Job, JobError> {
        let checkpoint: Checkpoint = serde_json::from_str(blob)?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(JobError::invalid_state(
                &checkpoint.job.guid,
                format!("checkpoint version {}", CHECKPOINT_VERSION),
                format!("version {}", checkpoint.version),
            ));
        }
        Ok(checkpoint.job)
    }

    pub(crate) fn new_status_record(&self, status: JobStatus) -> NewStatusRecord {
        let mut record = NewStatusRecord::new(&self.guid, &self.container_id, status);
        record.parent_guid = self.parent_guid.clone();
        record.provider = self.provider.clone();
        record.description = self.description.clone();
        record.email = self.owner_email.clone();
        record.file_path = self.log_file.clone();
        record.data_url = self.data_url.clone();
        record.active_task = self.active_task_id();
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn split_job() -> Job {
        Job::new(
            "/lab",
            "checksum",
            vec![TaskStep::split("checksum"), TaskStep::new("summarize")],
        )
        .with_description("hash files")
        .with_owner_email("owner@example.com")
        .with_inputs(vec!["a.txt".to_string(), "b.txt".to_string()])
    }

    #[test]
    fn test_checkpoint_round_trip_clears_queue_binding() {
        let mut job = split_job();
        job.parameters.insert("level".to_string(), json!(3));
        job.results.push(json!({"input": "a.txt"}));
        job.bind("queue-1");

        let restored = Job::from_checkpoint(&job.to_checkpoint().unwrap()).unwrap();

        assert_eq!(restored.bound_queue(), None);
        job.bound_queue = None;
        assert_eq!(restored, job);
    }

    #[test]
    fn test_checkpoint_with_unknown_version_is_rejected() {
        let blob = format!(
            "{{\"version\":99,\"job\":{}}}",
            serde_json::to_string(&split_job()).unwrap()
        );
        assert!(matches!(
            Job::from_checkpoint(&blob),
            Err(JobError::InvalidState { .. })
        ));
        assert!(matches!(
            Job::from_checkpoint("not json"),
            Err(JobError::Checkpoint(_))
        ));
    }

    #[test]
    fn test_create_split_jobs_makes_one_child_per_input() {
        let job = split_job();
        let children = job.create_split_jobs().unwrap();

        assert_eq!(children.len(), 2);
        for (child, input) in children.iter().zip(["a.txt", "b.txt"]) {
            assert_ne!(child.guid, job.guid);
            assert_eq!(child.parent_guid.as_deref(), Some(job.guid.as_str()));
            assert_eq!(child.container_id, "/lab");
            assert_eq!(child.steps, vec![TaskStep::split("checksum")]);
            assert_eq!(child.inputs, vec![input.to_string()]);
            assert_eq!(child.owner_email.as_deref(), Some("owner@example.com"));
        }
    }

    #[test]
    fn test_create_split_jobs_requires_split_step() {
        let mut job = split_job();
        job.advance();
        assert!(job.create_split_jobs().is_err());
    }

    #[test]
    fn test_advance_walks_steps() {
        let mut job = split_job();
        assert_eq!(job.active_task_id().as_deref(), Some("checksum"));
        assert!(job.advance());
        assert_eq!(job.active_task_id().as_deref(), Some("summarize"));
        assert!(!job.advance());
        assert_eq!(job.active_task(), None);
    }

    #[test]
    fn test_merge_split_job_collects_results() {
        let mut parent = split_job();
        let mut children = parent.create_split_jobs().unwrap();
        children[0].results.push(json!(1));
        children[1].results.push(json!(2));

        for child in &children {
            parent.merge_split_job(child);
        }
        assert_eq!(parent.results, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_job_deserializes_with_defaults() {
        let job: Job = serde_json::from_value(json!({
            "guid": "g1",
            "container_id": "/",
            "provider": "manual",
            "steps": [{"task_id": "summarize"}]
        }))
        .unwrap();
        assert!(job.allow_multiple_simultaneous_jobs);
        assert_eq!(job.active_task_id().as_deref(), Some("summarize"));
        assert!(!job.steps[0].split);

        let generated: Job = serde_json::from_value(json!({
            "container_id": "/lab",
            "provider": "manual",
            "steps": []
        }))
        .unwrap();
        assert_eq!(generated.guid.len(), 36);
    }
}
