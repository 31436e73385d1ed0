//! Outbound mail over SMTP (lettre)

use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use tracing::debug;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::services::transport::ComposedMessage;
use crate::types::{MailError, Result};

const IMPLICIT_TLS_PORT: u16 = 465;

pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    pub fn new(config: &SmtpConfig) -> Result<Self> {
        let builder = if config.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|e| MailError::Config(format!("invalid SMTP host '{}': {}", config.host, e)))?;

        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();

        Ok(Self { transport })
    }

    /// Send and return the generated Message-ID, without brackets.
    pub async fn send(&self, composed: &ComposedMessage) -> Result<String> {
        let message_id = generate_message_id(&composed.from);
        let message = build_message(composed, &message_id)?;

        self.transport.send(message).await.map_err(|e| {
            if e.is_permanent() {
                MailError::permanent(format!("SMTP send rejected: {}", e))
            } else {
                MailError::transient(format!("SMTP send failed: {}", e))
            }
        })?;

        debug!(message_id = %message_id, "SMTP accepted message");
        Ok(message_id)
    }
}

fn generate_message_id(from: &str) -> String {
    let domain = from
        .rsplit_once('@')
        .map(|(_, domain)| domain.trim_end_matches('>'))
        .filter(|domain| !domain.is_empty())
        .unwrap_or("mailweave.local");
    format!("{}@{}", Uuid::now_v7().simple(), domain)
}

fn parse_mailbox(addr: &str) -> Result<Mailbox> {
    addr.parse::<Mailbox>()
        .map_err(|e| MailError::permanent(format!("invalid address '{}': {}", addr, e)))
}

/// Build the MIME message. Address and build errors are permanent.
pub fn build_message(composed: &ComposedMessage, message_id: &str) -> Result<Message> {
    let mut builder = Message::builder()
        .from(parse_mailbox(&composed.from)?)
        .subject(composed.subject.clone())
        .message_id(Some(format!("<{}>", message_id)));

    if composed.to.is_empty() {
        return Err(MailError::permanent("message has no recipients"));
    }
    for to in &composed.to {
        builder = builder.to(parse_mailbox(to)?);
    }
    for cc in &composed.cc {
        builder = builder.cc(parse_mailbox(cc)?);
    }

    if let Some(parent) = &composed.in_reply_to {
        builder = builder.in_reply_to(format!("<{}>", parent));
    }
    if let Some(references) = &composed.references {
        builder = builder.references(references.clone());
    }

    let message = match &composed.body_html {
        Some(html) => builder.multipart(MultiPart::alternative_plain_html(
            composed.body_text.clone(),
            html.clone(),
        )),
        None => builder
            .header(ContentType::TEXT_PLAIN)
            .body(composed.body_text.clone()),
    }
    .map_err(|e| MailError::permanent(format!("failed to build message: {}", e)))?;

    Ok(message)
}
