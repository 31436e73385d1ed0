//! Mail transport capability
//!
//! The engine never talks IMAP or SMTP directly. It goes through
//! [`MailTransport`], which the binary binds to real servers
//! (see `adapters::ImapSmtpTransport`) and tests bind to [`MemoryTransport`].

use std::collections::{BTreeSet, VecDeque};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::services::helpers::backoff::RetryPolicy;
use crate::types::{MailError, RawMessage, Result};

/// An outbound message ready to hand to the transport.
///
/// Ids are kept without angle brackets, except `references` which is the
/// header value as it travels (`<a> <b>`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposedMessage {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
}

/// Result of a send after retries. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub ok: bool,
    pub message_id: String,
}

impl SendOutcome {
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            ok: true,
            message_id: message_id.into(),
        }
    }

    pub fn failed() -> Self {
        Self {
            ok: false,
            message_id: String::new(),
        }
    }
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Every message of the watched mailbox not yet flagged seen.
    async fn fetch_unseen(&self) -> Result<Vec<RawMessage>>;

    async fn mark_seen(&self, uid: u32) -> Result<()>;

    /// Send and return the Message-ID the message went out with, without brackets.
    async fn send(&self, message: &ComposedMessage) -> Result<String>;
}

/// `References` for a reply to `replied_to`.
///
/// The replied-to id is appended to the existing chain unless the chain
/// already carries it.
pub fn compose_references(existing: Option<&str>, replied_to: &str) -> String {
    let token = format!("<{}>", replied_to);
    match existing.map(str::trim).filter(|refs| !refs.is_empty()) {
        None => token,
        Some(refs) if refs.contains(&token) => refs.to_string(),
        Some(refs) => format!("{} {}", refs, token),
    }
}

/// Send with retries on transient failures.
pub async fn send_with_retry(
    transport: &dyn MailTransport,
    policy: &RetryPolicy,
    message: &ComposedMessage,
) -> SendOutcome {
    let result = policy
        .retry("send", |attempt| async move {
            if attempt > 1 {
                info!(attempt, "Retrying send of '{}'", message.subject);
            }
            transport.send(message).await
        })
        .await;

    match result {
        Ok(message_id) => {
            info!(message_id = %message_id, "Sent '{}' to {:?}", message.subject, message.to);
            SendOutcome::sent(message_id)
        }
        Err(e) => {
            error!("Failed to send '{}' to {:?}: {}", message.subject, message.to, e);
            SendOutcome::failed()
        }
    }
}

#[derive(Default)]
struct MemoryState {
    inbox: Vec<RawMessage>,
    seen: BTreeSet<u32>,
    sent: Vec<ComposedMessage>,
    fetch_failures: VecDeque<MailError>,
    mark_seen_failures: VecDeque<MailError>,
    send_script: VecDeque<Result<String>>,
    next_id: u64,
}

/// In-process mailbox. Messages are delivered with [`MemoryTransport::deliver`],
/// and failures can be scripted per call.
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliver(&self, message: RawMessage) {
        self.state.lock().await.inbox.push(message);
    }

    /// The next `fetch_unseen` fails with `err`.
    pub async fn fail_next_fetch(&self, err: MailError) {
        self.state.lock().await.fetch_failures.push_back(err);
    }

    /// The next `mark_seen` fails with `err`.
    pub async fn fail_next_mark_seen(&self, err: MailError) {
        self.state.lock().await.mark_seen_failures.push_back(err);
    }

    /// Queue results for upcoming sends. Unscripted sends succeed.
    pub async fn script_sends(&self, results: impl IntoIterator<Item = Result<String>>) {
        self.state.lock().await.send_script.extend(results);
    }

    pub async fn seen(&self) -> Vec<u32> {
        self.state.lock().await.seen.iter().copied().collect()
    }

    pub async fn sent(&self) -> Vec<ComposedMessage> {
        self.state.lock().await.sent.clone()
    }
}

#[async_trait]
impl MailTransport for MemoryTransport {
    async fn fetch_unseen(&self) -> Result<Vec<RawMessage>> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }
        Ok(state
            .inbox
            .iter()
            .filter(|m| !state.seen.contains(&m.uid))
            .cloned()
            .collect())
    }

    async fn mark_seen(&self, uid: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.mark_seen_failures.pop_front() {
            return Err(err);
        }
        state.seen.insert(uid);
        Ok(())
    }

    async fn send(&self, message: &ComposedMessage) -> Result<String> {
        let mut state = self.state.lock().await;
        let message_id = match state.send_script.pop_front() {
            Some(result) => result?,
            None => {
                state.next_id += 1;
                format!("sent-{}@memory.local", state.next_id)
            }
        };
        state.sent.push(message.clone());
        Ok(message_id)
    }
}
