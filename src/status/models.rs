use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const MAX_STATUS_LEN: usize = 100;
pub const MAX_INFO_LEN: usize = 1024;
pub const MAX_PATH_LEN: usize = 1024;
pub const MAX_DESCRIPTION_LEN: usize = 255;
pub const MAX_EMAIL_LEN: usize = 255;

/// Lifecycle state of a job as persisted in its status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Waiting,
    Running,
    Complete,
    Error,
    Cancelled,
    /// Cancellation requested on a running job, not yet observed by it.
    Cancelling,
    Interrupted,
    /// Parent waiting on its split children.
    Split,
    WaitingForFiles,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Running => "RUNNING",
            JobStatus::Complete => "COMPLETE",
            JobStatus::Error => "ERROR",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::Cancelling => "CANCELLING",
            JobStatus::Interrupted => "INTERRUPTED",
            JobStatus::Split => "SPLIT",
            JobStatus::WaitingForFiles => "WAITING_FOR_FILES",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(JobStatus::Waiting),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETE" => Some(JobStatus::Complete),
            "ERROR" => Some(JobStatus::Error),
            "CANCELLED" => Some(JobStatus::Cancelled),
            "CANCELLING" => Some(JobStatus::Cancelling),
            "INTERRUPTED" => Some(JobStatus::Interrupted),
            "SPLIT" => Some(JobStatus::Split),
            "WAITING_FOR_FILES" => Some(JobStatus::WaitingForFiles),
            _ => None,
        }
    }

    /// Statuses a failure digest reports on.
    pub fn failure_statuses() -> &'static [JobStatus] {
        &[JobStatus::Error, JobStatus::Interrupted, JobStatus::Cancelled]
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted projection of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub row_id: i64,
    pub job_guid: String,
    pub parent_guid: Option<String>,
    pub container_id: String,
    pub provider: String,
    pub status: JobStatus,
    pub info: Option<String>,
    pub data_url: Option<String>,
    pub description: Option<String>,
    pub file_path: Option<String>,
    pub email: Option<String>,
    pub had_error: bool,
    #[serde(skip_serializing)]
    pub checkpoint: Option<String>,
    pub active_task: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl StatusRecord {
    /// ERROR only counts as active while a checkpoint is around to retry from.
    pub fn is_active(&self) -> bool {
        match self.status {
            JobStatus::Complete | JobStatus::Cancelled | JobStatus::WaitingForFiles => false,
            JobStatus::Error => self.checkpoint.is_some(),
            _ => true,
        }
    }
}

/// Fields for a brand new status record.
#[derive(Debug, Clone)]
pub struct NewStatusRecord {
    pub job_guid: String,
    pub parent_guid: Option<String>,
    pub container_id: String,
    pub provider: String,
    pub status: JobStatus,
    pub info: Option<String>,
    pub data_url: Option<String>,
    pub description: Option<String>,
    pub file_path: Option<String>,
    pub email: Option<String>,
    pub checkpoint: Option<String>,
    pub active_task: Option<String>,
}

impl NewStatusRecord {
    pub fn new(job_guid: impl Into<String>, container_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            job_guid: job_guid.into(),
            parent_guid: None,
            container_id: container_id.into(),
            provider: String::new(),
            status,
            info: None,
            data_url: None,
            description: None,
            file_path: None,
            email: None,
            checkpoint: None,
            active_task: None,
        }
    }
}

/// Sparse patch over a status record.
///
/// `None` and blank strings leave the stored value untouched. `checkpoint`
/// and `active_task` use a nested option so they can be cleared explicitly.
/// Moving to [`JobStatus::Complete`] clears both regardless of the patch.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub job_guid: Option<String>,
    pub parent_guid: Option<String>,
    pub provider: Option<String>,
    pub status: Option<JobStatus>,
    pub info: Option<String>,
    pub data_url: Option<String>,
    pub description: Option<String>,
    pub file_path: Option<String>,
    pub email: Option<String>,
    pub had_error: Option<bool>,
    pub checkpoint: Option<Option<String>>,
    pub active_task: Option<Option<String>>,
}

impl StatusUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_checkpoint(mut self, checkpoint: String, active_task: Option<String>) -> Self {
        self.checkpoint = Some(Some(checkpoint));
        self.active_task = Some(active_task);
        self
    }
}

/// Identifies a status record either by row id or by job GUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatusRef {
    RowId(i64),
    Guid(String),
}

impl std::fmt::Display for StatusRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusRef::RowId(id) => write!(f, "row {}", id),
            StatusRef::Guid(guid) => write!(f, "job {}", guid),
        }
    }
}

impl From<&str> for StatusRef {
    fn from(guid: &str) -> Self {
        StatusRef::Guid(guid.to_string())
    }
}

impl From<i64> for StatusRef {
    fn from(row_id: i64) -> Self {
        StatusRef::RowId(row_id)
    }
}

/// Filter for [`super::StatusStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct StatusFilter {
    pub statuses: Vec<JobStatus>,
    /// Container subtree; `/` or `None` matches every container.
    pub container: Option<String>,
    pub modified_from: Option<DateTime<Utc>>,
    pub modified_before: Option<DateTime<Utc>>,
}

/// Truncates to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((byte_index, _)) => value[..byte_index].to_string(),
        None => value.to_string(),
    }
}

/// Returns `Some` only for non-blank values.
pub(crate) fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
