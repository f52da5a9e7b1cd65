mod file_config;

pub use file_config::{FileConfig, JobQueueConfig, NotificationsConfig};

use crate::notifications::{NotificationDefaults, NotificationSettings};
use crate::pipeline::DEFAULT_POOL_SIZE;
use anyhow::{bail, Result};
use chrono::NaiveTime;
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub pool_size: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub db_dir: PathBuf,
    pub log_dir: PathBuf,

    // Feature configs (with defaults)
    pub job_queue: JobQueueSettings,
    pub notifications: NotificationsSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let log_dir = file
            .log_dir
            .map(PathBuf::from)
            .or_else(|| cli.log_dir.clone())
            .unwrap_or_else(|| db_dir.join("logs"));

        let queue_file = file.job_queue.unwrap_or_default();
        let pool_size = queue_file
            .pool_size
            .or(cli.pool_size)
            .unwrap_or(DEFAULT_POOL_SIZE);
        if pool_size == 0 {
            bail!("job_queue.pool_size must be at least 1");
        }

        let n_file = file.notifications.unwrap_or_default();
        let defaults = NotificationsSettings::default();
        let start_time = n_file.start_time.unwrap_or(defaults.start_time);
        if NaiveTime::parse_from_str(&start_time, "%H:%M").is_err() {
            bail!(
                "notifications.start_time must be HH:MM, got {:?}",
                start_time
            );
        }
        let notifications = NotificationsSettings {
            enabled: n_file.enabled.unwrap_or(defaults.enabled),
            success_interval_hours: n_file
                .success_interval_hours
                .unwrap_or(defaults.success_interval_hours),
            failure_interval_hours: n_file
                .failure_interval_hours
                .unwrap_or(defaults.failure_interval_hours),
            start_time,
            from_address: n_file.from_address.unwrap_or(defaults.from_address),
        };

        Ok(Self {
            db_dir,
            log_dir,
            job_queue: JobQueueSettings { pool_size },
            notifications,
        })
    }

    pub fn status_db_path(&self) -> PathBuf {
        self.db_dir.join("status.db")
    }
}

#[derive(Debug, Clone)]
pub struct JobQueueSettings {
    pub pool_size: usize,
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationsSettings {
    pub enabled: bool,
    pub success_interval_hours: u32,
    pub failure_interval_hours: u32,
    pub start_time: String,
    pub from_address: String,
}

impl Default for NotificationsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            success_interval_hours: 24,
            failure_interval_hours: 24,
            start_time: "02:00".to_string(),
            from_address: "pipeline@localhost".to_string(),
        }
    }
}

impl NotificationsSettings {
    /// Site-wide digest settings. Both kinds are disabled unless
    /// notifications are enabled.
    pub fn defaults(&self) -> NotificationDefaults {
        let settings = |hours: u32| {
            if self.enabled {
                NotificationSettings {
                    interval_hours: hours,
                    start_time: self.start_time.clone(),
                    recipients: Vec::new(),
                }
            } else {
                NotificationSettings::disabled()
            }
        };
        NotificationDefaults {
            from_address: self.from_address.clone(),
            success: settings(self.success_interval_hours),
            failure: settings(self.failure_interval_hours),
        }
    }
}
