//! Digest notifications about finished pipeline jobs.

mod mail;
mod models;
mod schedule;
mod scheduler;

pub use mail::{LogMailTransport, MailTransport, MemoryMailTransport};
pub use models::{MailMessage, NotificationKind, NotificationSettings, NotificationTask};
pub use schedule::{container_ancestors, next_fire};
pub use scheduler::{NotificationDefaults, NotificationScheduler};
