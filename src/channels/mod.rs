//! Mail channels: outbound SMTP and inbound mailbox polling.

pub mod email;
pub mod email_poller;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ExternalError;

pub use email::{EmailConfig, ImapMailbox, SmtpMailer};
pub use email_poller::spawn_email_poller;

/// A message to send to a lead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Receipt for a sent message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentEmail {
    pub message_id: String,
}

/// A reply fetched from the mailbox (or pushed through the webhook).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEmail {
    pub sender: String,
    #[serde(default)]
    pub subject: String,
    pub body: String,
    pub message_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<SentEmail, ExternalError>;
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Fetch messages not seen before. Each message is returned at most once.
    async fn fetch_new(&self) -> Result<Vec<InboundEmail>, ExternalError>;
}
