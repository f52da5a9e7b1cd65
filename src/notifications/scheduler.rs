//! Periodic digest emails about finished jobs.
//!
//! One timer runs per (container, kind) with digests enabled. Settings are
//! looked up on the container and then on each ancestor, falling back to the
//! site-wide defaults. Registrations and last-fire times live in the
//! property store so [`NotificationScheduler::restore`] can rebuild every
//! timer after a restart.

use super::mail::MailTransport;
use super::models::{MailMessage, NotificationKind, NotificationSettings, NotificationTask};
use super::schedule::{container_ancestors, next_fire};
use crate::metrics;
use crate::status::{PropertyStore, StatusFilter, StatusRecord, StatusStore};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TASKS_SCOPE: &str = "notification.tasks";
const LAST_FIRE_SCOPE: &str = "notification.last_fire";

fn settings_scope(kind: NotificationKind) -> String {
    format!("notification.settings.{}", kind)
}

fn task_key(container_id: &str, kind: NotificationKind) -> String {
    format!("{}|{}", container_id, kind)
}

fn parse_task_key(key: &str) -> Option<(String, NotificationKind)> {
    let (container, kind) = key.rsplit_once('|')?;
    Some((container.to_string(), NotificationKind::parse(kind)?))
}

/// Site-wide fallbacks used when no container defines settings.
#[derive(Debug, Clone)]
pub struct NotificationDefaults {
    pub from_address: String,
    pub success: NotificationSettings,
    pub failure: NotificationSettings,
}

impl NotificationDefaults {
    fn for_kind(&self, kind: NotificationKind) -> &NotificationSettings {
        match kind {
            NotificationKind::Success => &self.success,
            NotificationKind::Failure => &self.failure,
        }
    }
}

impl Default for NotificationDefaults {
    fn default() -> Self {
        Self {
            from_address: "pipeline@localhost".to_string(),
            success: NotificationSettings::disabled(),
            failure: NotificationSettings::disabled(),
        }
    }
}

pub struct NotificationScheduler {
    store: Arc<dyn StatusStore>,
    properties: Arc<dyn PropertyStore>,
    transport: Arc<dyn MailTransport>,
    defaults: NotificationDefaults,
    timers: Mutex<HashMap<(String, NotificationKind), CancellationToken>>,
    shutdown_token: CancellationToken,
}

impl NotificationScheduler {
    pub fn new(
        store: Arc<dyn StatusStore>,
        properties: Arc<dyn PropertyStore>,
        transport: Arc<dyn MailTransport>,
        defaults: NotificationDefaults,
    ) -> Self {
        Self {
            store,
            properties,
            transport,
            defaults,
            timers: Mutex::new(HashMap::new()),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Settings for `container_id`, inherited from the nearest ancestor that
    /// defines them.
    pub fn settings_for(&self, container_id: &str, kind: NotificationKind) -> Result<NotificationSettings> {
        let scope = settings_scope(kind);
        for container in container_ancestors(container_id) {
            if let Some(raw) = self.properties.get_property(&scope, &container)? {
                return serde_json::from_str(&raw).with_context(|| {
                    format!("Invalid {} notification settings for {}", kind, container)
                });
            }
        }
        Ok(self.defaults.for_kind(kind).clone())
    }

    /// Stores new settings for (container, kind) and replaces its timer.
    pub fn update_settings(
        self: &Arc<Self>,
        container_id: &str,
        kind: NotificationKind,
        settings: NotificationSettings,
    ) -> Result<()> {
        settings.start_time()?;
        self.properties.set_property(
            &settings_scope(kind),
            container_id,
            &serde_json::to_string(&settings)?,
        )?;

        let key = task_key(container_id, kind);
        if settings.is_enabled() {
            self.properties
                .set_property(TASKS_SCOPE, &key, container_id)?;
            self.schedule(container_id, kind, &settings)?;
        } else {
            self.properties.delete_property(TASKS_SCOPE, &key)?;
            self.cancel(container_id, kind);
        }
        info!(
            "Updated {} notifications for {}: every {}h from {}",
            kind, container_id, settings.interval_hours, settings.start_time
        );
        Ok(())
    }

    /// Recreates a timer for every registered (container, kind). A
    /// registration whose settings cannot be read is skipped with a warning.
    /// Returns how many timers are running afterwards.
    pub fn restore(self: &Arc<Self>) -> Result<usize> {
        let mut restored = 0;
        for (key, container_id) in self.properties.list_properties(TASKS_SCOPE)? {
            let Some((_, kind)) = parse_task_key(&key) else {
                warn!("Ignoring malformed notification task key {}", key);
                continue;
            };
            let settings = match self.settings_for(&container_id, kind) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Not restoring {} notifications for {}: {:#}", kind, container_id, e);
                    continue;
                }
            };
            if !settings.is_enabled() {
                continue;
            }
            if let Err(e) = self.schedule(&container_id, kind, &settings) {
                warn!("Not restoring {} notifications for {}: {:#}", kind, container_id, e);
                continue;
            }
            restored += 1;
        }
        info!("Restored {} notification timers", restored);
        Ok(restored)
    }

    /// Registers root-level timers for every kind whose site-wide default is
    /// enabled and that has no registration yet.
    pub fn enable_defaults(self: &Arc<Self>) -> Result<usize> {
        let mut enabled = 0;
        for kind in [NotificationKind::Success, NotificationKind::Failure] {
            if !self.defaults.for_kind(kind).is_enabled() {
                continue;
            }
            let key = task_key("/", kind);
            if self.properties.get_property(TASKS_SCOPE, &key)?.is_some() {
                continue;
            }
            let settings = match self.settings_for("/", kind) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!("Not enabling default {} notifications: {:#}", kind, e);
                    continue;
                }
            };
            if !settings.is_enabled() {
                continue;
            }
            self.properties.set_property(TASKS_SCOPE, &key, "/")?;
            self.schedule("/", kind, &settings)?;
            enabled += 1;
        }
        Ok(enabled)
    }

    /// Snapshot of running timers. Timers whose settings became unreadable
    /// are left out.
    pub fn tasks(&self) -> Result<Vec<NotificationTask>> {
        let keys: Vec<(String, NotificationKind)> = {
            let timers = self.timers.lock().unwrap();
            timers.keys().cloned().collect()
        };
        let now = Utc::now();
        let mut tasks = Vec::new();
        for (container_id, kind) in keys {
            let read = self
                .settings_for(&container_id, kind)
                .and_then(|settings| Ok((settings.start_time()?, settings)));
            let (start_time, settings) = match read {
                Ok(read) => read,
                Err(e) => {
                    warn!("Skipping {} notifications for {}: {:#}", kind, container_id, e);
                    continue;
                }
            };
            let next = next_fire(now, settings.interval_hours, start_time);
            tasks.push(NotificationTask {
                last_fire: self.last_fire(&container_id, kind)?,
                next_fire: next,
                container_id,
                kind,
                settings,
            });
        }
        tasks.sort_by(|a, b| (&a.container_id, a.kind).cmp(&(&b.container_id, b.kind)));
        Ok(tasks)
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
        self.timers.lock().unwrap().clear();
    }

    fn cancel(&self, container_id: &str, kind: NotificationKind) {
        if let Some(token) = self
            .timers
            .lock()
            .unwrap()
            .remove(&(container_id.to_string(), kind))
        {
            token.cancel();
        }
    }

    fn schedule(
        self: &Arc<Self>,
        container_id: &str,
        kind: NotificationKind,
        settings: &NotificationSettings,
    ) -> Result<()> {
        let start_time = settings.start_time()?;
        let interval_hours = settings.interval_hours;
        let token = self.shutdown_token.child_token();
        if let Some(previous) = self
            .timers
            .lock()
            .unwrap()
            .insert((container_id.to_string(), kind), token.clone())
        {
            previous.cancel();
        }

        let scheduler = Arc::clone(self);
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = next_fire(now, interval_hours, start_time) else {
                    break;
                };
                let wait = (next - now).to_std().unwrap_or_default();
                debug!("{} digest for {} due at {}", kind, container_id, next);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let scheduler = Arc::clone(&scheduler);
                        let container = container_id.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            scheduler.fire(&container, kind, Utc::now())
                        })
                        .await;
                        match result {
                            Ok(Ok(sent)) => debug!("{} digest for {} sent {} messages", kind, container_id, sent),
                            Ok(Err(e)) => error!("{} digest for {} failed: {:#}", kind, container_id, e),
                            Err(e) => error!("{} digest for {} panicked: {}", kind, container_id, e),
                        }
                    }
                    _ = token.cancelled() => {
                        debug!("{} digest timer for {} stopped", kind, container_id);
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    pub fn last_fire(&self, container_id: &str, kind: NotificationKind) -> Result<Option<DateTime<Utc>>> {
        let raw = self
            .properties
            .get_property(LAST_FIRE_SCOPE, &task_key(container_id, kind))?;
        Ok(raw.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        }))
    }

    /// Sends the digests due at `now` and returns how many messages went out.
    ///
    /// The window runs from the previous fire (or one interval back) up to
    /// `now`, and the last-fire time moves to `now` even when sending fails.
    pub fn fire(&self, container_id: &str, kind: NotificationKind, now: DateTime<Utc>) -> Result<usize> {
        let settings = self.settings_for(container_id, kind)?;
        let window_start = match self.last_fire(container_id, kind)? {
            Some(last) => last,
            None => now - Duration::hours(i64::from(settings.interval_hours.max(1))),
        };

        let result = self.send_digests(container_id, kind, &settings, window_start, now);

        self.properties.set_property(
            LAST_FIRE_SCOPE,
            &task_key(container_id, kind),
            &now.to_rfc3339(),
        )?;
        result
    }

    fn send_digests(
        &self,
        container_id: &str,
        kind: NotificationKind,
        settings: &NotificationSettings,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<usize> {
        let records = self.store.list(&StatusFilter {
            statuses: kind.statuses(),
            container: Some(container_id.to_string()),
            modified_from: Some(window_start),
            modified_before: Some(window_end),
        })?;
        if records.is_empty() {
            return Ok(0);
        }

        let mut by_recipients: BTreeMap<Vec<String>, Vec<&StatusRecord>> = BTreeMap::new();
        for record in &records {
            let recipients: BTreeSet<String> = if settings.recipients.is_empty() {
                record.email.iter().cloned().collect()
            } else {
                settings.recipients.iter().cloned().collect()
            };
            if recipients.is_empty() {
                continue;
            }
            by_recipients
                .entry(recipients.into_iter().collect())
                .or_default()
                .push(record);
        }

        let mut sent = 0;
        for (recipients, jobs) in by_recipients {
            let message = self.build_message(container_id, kind, recipients, &jobs);
            match self.transport.send(&message) {
                Ok(()) => {
                    sent += 1;
                    metrics::record_notification(kind.as_str(), true);
                }
                Err(e) => {
                    warn!(
                        "Failed to send {} digest to {}: {:#}",
                        kind,
                        message.to.join(", "),
                        e
                    );
                    metrics::record_notification(kind.as_str(), false);
                }
            }
        }
        Ok(sent)
    }

    fn build_message(
        &self,
        container_id: &str,
        kind: NotificationKind,
        to: Vec<String>,
        jobs: &[&StatusRecord],
    ) -> MailMessage {
        let subject = match kind {
            NotificationKind::Success => {
                format!("[{}] {} job(s) completed", container_id, jobs.len())
            }
            NotificationKind::Failure => {
                format!("[{}] {} job(s) did not complete", container_id, jobs.len())
            }
        };
        let mut body = String::new();
        for job in jobs {
            body.push_str(&format!(
                "- {} [{}] {} at {}",
                job.description.as_deref().unwrap_or(&job.job_guid),
                job.container_id,
                job.status,
                job.modified_at.to_rfc3339()
            ));
            if kind == NotificationKind::Failure {
                if let Some(info) = &job.info {
                    body.push_str(&format!(": {}", info));
                }
            }
            body.push('\n');
        }
        MailMessage {
            from: self.defaults.from_address.clone(),
            to,
            subject,
            body,
        }
    }
}
