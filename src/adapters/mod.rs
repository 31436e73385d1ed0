//! Bindings of the engine's capability traits to real backends

pub mod imap;
pub mod smtp;
pub mod sqlite;

use async_trait::async_trait;

use crate::config::AppConfig;
use crate::services::transport::{ComposedMessage, MailTransport};
use crate::types::{RawMessage, Result};
use self::imap::ImapMailbox;
use self::smtp::SmtpSender;

/// [`MailTransport`] over an IMAP mailbox and an SMTP relay.
pub struct ImapSmtpTransport {
    imap: ImapMailbox,
    smtp: SmtpSender,
}

impl ImapSmtpTransport {
    pub fn new(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            imap: ImapMailbox::new(config.imap.clone()),
            smtp: SmtpSender::new(&config.smtp)?,
        })
    }

    pub async fn shutdown(&self) {
        self.imap.logout().await;
    }
}

#[async_trait]
impl MailTransport for ImapSmtpTransport {
    async fn fetch_unseen(&self) -> Result<Vec<RawMessage>> {
        self.imap.fetch_unseen().await
    }

    async fn mark_seen(&self, uid: u32) -> Result<()> {
        self.imap.mark_seen(uid).await
    }

    async fn send(&self, message: &ComposedMessage) -> Result<String> {
        self.smtp.send(message).await
    }
}
