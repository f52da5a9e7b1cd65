use super::models::MailMessage;
use anyhow::Result;
use std::sync::Mutex;
use tracing::info;

/// Delivers digest messages.
pub trait MailTransport: Send + Sync {
    fn send(&self, message: &MailMessage) -> Result<()>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Default)]
pub struct LogMailTransport;

impl MailTransport for LogMailTransport {
    fn send(&self, message: &MailMessage) -> Result<()> {
        info!(
            "Mail from {} to {}: {}\n{}",
            message.from,
            message.to.join(", "),
            message.subject,
            message.body
        );
        Ok(())
    }
}

/// Keeps sent messages in memory.
#[derive(Debug, Default)]
pub struct MemoryMailTransport {
    sent: Mutex<Vec<MailMessage>>,
}

impl MemoryMailTransport {
    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl MailTransport for MemoryMailTransport {
    fn send(&self, message: &MailMessage) -> Result<()> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
