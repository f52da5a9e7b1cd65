//! Notification data models

use crate::status::JobStatus;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Which outcome a digest reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Success,
    Failure,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Success => "success",
            NotificationKind::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(NotificationKind::Success),
            "failure" => Some(NotificationKind::Failure),
            _ => None,
        }
    }

    pub fn statuses(&self) -> Vec<JobStatus> {
        match self {
            NotificationKind::Success => vec![JobStatus::Complete],
            NotificationKind::Failure => JobStatus::failure_statuses().to_vec(),
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest schedule for one (container, kind).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Hours between digests; 0 disables them.
    pub interval_hours: u32,
    /// Daily anchor for the schedule, `HH:MM` in UTC.
    pub start_time: String,
    /// Explicit recipients. When empty each job's owner is notified.
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl NotificationSettings {
    pub fn disabled() -> Self {
        Self {
            interval_hours: 0,
            start_time: "00:00".to_string(),
            recipients: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval_hours > 0
    }

    pub fn start_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.start_time, "%H:%M")
            .with_context(|| format!("Invalid start time '{}', expected HH:MM", self.start_time))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

/// A scheduled digest as currently known to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationTask {
    pub container_id: String,
    pub kind: NotificationKind,
    pub settings: NotificationSettings,
    pub last_fire: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
}
