//! Threaded replies to stored messages

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::adapters::sqlite::ThreadStore;
use crate::services::helpers::address::{normalize_address, same_address};
use crate::services::helpers::backoff::RetryPolicy;
use crate::services::ingest::MessageHandler;
use crate::services::parser::extract_message_ids;
use crate::services::transport::{
    compose_references, send_with_retry, ComposedMessage, MailTransport, SendOutcome,
};
use crate::types::{MailError, Message, ParsedMessage, Result};

pub struct ReplyService {
    store: Arc<ThreadStore>,
    transport: Arc<dyn MailTransport>,
    system_address: String,
    policy: RetryPolicy,
}

impl ReplyService {
    pub fn new(
        store: Arc<ThreadStore>,
        transport: Arc<dyn MailTransport>,
        system_address: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            system_address: system_address.into(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Reply to the stored message `message_id`.
    ///
    /// On a successful send the reply is recorded in the original's thread as a
    /// system-sent message. Every failure is reported as `ok = false`.
    pub async fn reply_to(
        &self,
        message_id: &str,
        body_text: &str,
        body_html: Option<&str>,
    ) -> SendOutcome {
        let original = match self
            .store
            .unit_of_work(|uow| uow.find_message_by_message_id(message_id))
        {
            Ok(Some(original)) => original,
            Ok(None) => {
                warn!(message_id = %message_id, "Cannot reply: message not found");
                return SendOutcome::failed();
            }
            Err(e) => {
                error!(message_id = %message_id, "Cannot reply: lookup failed: {}", e);
                return SendOutcome::failed();
            }
        };

        let reply = build_reply(&original, &self.system_address, body_text, body_html);
        if reply.to.is_empty() {
            warn!(message_id = %message_id, "Cannot reply: no recipient besides the system address");
            return SendOutcome::failed();
        }
        let outcome = send_with_retry(self.transport.as_ref(), &self.policy, &reply).await;
        if !outcome.ok {
            return outcome;
        }

        if let Err(e) = self.record_sent(&original, &reply, &outcome.message_id) {
            error!(
                message_id = %outcome.message_id,
                "Reply was sent but could not be recorded: {}", e
            );
        }
        outcome
    }

    fn record_sent(&self, original: &Message, reply: &ComposedMessage, sent_id: &str) -> Result<()> {
        let parsed = ParsedMessage {
            message_id: sent_id.to_string(),
            in_reply_to: reply.in_reply_to.clone(),
            thread_parent: reply.in_reply_to.clone(),
            references: reply.references.as_deref().map(extract_message_ids),
            subject: reply.subject.clone(),
            sender: normalize_address(&reply.from),
            recipients: reply.to.clone(),
            cc: reply.cc.clone(),
            body_text: reply.body_text.clone(),
            body_html: reply.body_html.clone().unwrap_or_default(),
            received_date: Utc::now(),
        };

        let stored = self.store.unit_of_work(|uow| {
            let mut thread = uow.find_thread_by_id(&original.thread_id)?.ok_or_else(|| {
                MailError::Persistence(format!("thread {} no longer exists", original.thread_id))
            })?;
            uow.add_participants(&mut thread, parsed.recipients.iter().map(String::as_str))?;
            uow.save_message(&thread.id, &parsed, true)
        })?;

        info!(
            message_id = %stored.message_id,
            "Recorded reply in thread {}", stored.thread_id
        );
        Ok(())
    }
}

/// Compose a reply to `original` from `system_address`.
///
/// Recipients are the original sender followed by the original recipients,
/// minus the system address (in any position) and duplicates.
pub fn build_reply(
    original: &Message,
    system_address: &str,
    body_text: &str,
    body_html: Option<&str>,
) -> ComposedMessage {
    let mut to: Vec<String> = Vec::new();
    let candidates = std::iter::once(&original.sender).chain(original.recipients.iter());
    for addr in candidates {
        let addr = normalize_address(addr);
        if addr.is_empty() || same_address(&addr, system_address) {
            continue;
        }
        if !to.contains(&addr) {
            to.push(addr);
        }
    }

    ComposedMessage {
        from: system_address.to_string(),
        to,
        cc: Vec::new(),
        subject: reply_subject(&original.subject),
        body_text: body_text.to_string(),
        body_html: body_html.map(str::to_string),
        in_reply_to: Some(original.message_id.clone()),
        references: Some(compose_references(
            original.references.as_deref(),
            &original.message_id,
        )),
    }
}

pub fn reply_subject(subject: &str) -> String {
    if subject.trim_start().to_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {}", subject)
    }
}

/// Sends a short acknowledgment for every inbound message.
pub struct AcknowledgmentResponder {
    replies: Arc<ReplyService>,
    signature: String,
}

impl AcknowledgmentResponder {
    pub fn new(replies: Arc<ReplyService>, signature: impl Into<String>) -> Self {
        Self {
            replies,
            signature: signature.into(),
        }
    }

    fn body(&self, parsed: &ParsedMessage) -> String {
        format!(
            "Thank you for your email regarding \"{}\".\n\n\
             We have received your message and will get back to you shortly.\n\n\
             {}",
            parsed.subject, self.signature
        )
    }
}

#[async_trait]
impl MessageHandler for AcknowledgmentResponder {
    async fn on_message(&self, parsed: &ParsedMessage, stored: &Message) -> Result<()> {
        let outcome = self
            .replies
            .reply_to(&stored.message_id, &self.body(parsed), None)
            .await;

        if outcome.ok {
            Ok(())
        } else {
            Err(MailError::permanent(format!(
                "acknowledgment to {} was not sent",
                stored.message_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transport::MemoryTransport;
    use std::time::Duration;

    const BOT: &str = "bot@example.com";

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
            max_attempts: 5,
        }
    }

    fn inbound(message_id: &str, references: Option<Vec<&str>>) -> ParsedMessage {
        ParsedMessage {
            message_id: message_id.to_string(),
            in_reply_to: None,
            thread_parent: None,
            references: references.map(|r| r.into_iter().map(String::from).collect()),
            subject: "Plans".to_string(),
            sender: "alice@example.com".to_string(),
            recipients: vec![BOT.to_string(), "carol@example.com".to_string()],
            cc: vec![],
            body_text: "hello".to_string(),
            body_html: String::new(),
            received_date: Utc::now(),
        }
    }

    fn seed(store: &ThreadStore, parsed: &ParsedMessage) -> Message {
        store
            .unit_of_work(|uow| {
                let mut thread = uow.create_thread("k1", &parsed.subject)?;
                uow.add_participants(&mut thread, parsed.participant_addresses())?;
                uow.save_message(&thread.id, parsed, false)
            })
            .unwrap()
    }

    fn service(store: &Arc<ThreadStore>, transport: &Arc<MemoryTransport>) -> ReplyService {
        ReplyService::new(store.clone(), transport.clone(), BOT).with_retry_policy(fast())
    }

    #[test]
    fn test_reply_subject() {
        assert_eq!(reply_subject("Plans"), "Re: Plans");
        assert_eq!(reply_subject("RE: Plans"), "RE: Plans");
        assert_eq!(reply_subject(""), "Re: ");
    }

    #[test]
    fn test_build_reply_recipients_and_threading() {
        let store = ThreadStore::in_memory().unwrap();
        let original = seed(&store, &inbound("b", Some(vec!["a", "b"])));

        let reply = build_reply(&original, BOT, "thanks", None);
        assert_eq!(reply.to, vec!["alice@example.com", "carol@example.com"]);
        assert_eq!(reply.subject, "Re: Plans");
        assert_eq!(reply.in_reply_to.as_deref(), Some("b"));
        assert_eq!(reply.references.as_deref(), Some("<a> <b>"));
    }

    #[tokio::test]
    async fn test_reply_is_recorded_in_original_thread() {
        let store = Arc::new(ThreadStore::in_memory().unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let original = seed(&store, &inbound("b", Some(vec!["a", "b"])));
        transport.script_sends(vec![Ok("reply-1@example.com".to_string())]).await;

        let outcome = service(&store, &transport).reply_to("b", "thanks", Some("<p>thanks</p>")).await;
        assert_eq!(outcome, SendOutcome::sent("reply-1@example.com"));

        let messages = store.thread_messages("k1").unwrap();
        assert_eq!(messages.len(), 2);
        let reply = messages
            .iter()
            .find(|m| m.message_id == "reply-1@example.com")
            .unwrap();
        assert!(reply.is_sent_by_system);
        assert_eq!(reply.thread_id, original.thread_id);
        assert_eq!(reply.sender, BOT);
        assert_eq!(reply.in_reply_to.as_deref(), Some("b"));
        assert_eq!(reply.references.as_deref(), Some("<a> <b>"));
        assert_eq!(reply.body_html.as_deref(), Some("<p>thanks</p>"));
    }

    #[tokio::test]
    async fn test_reply_appends_new_reference() {
        let store = Arc::new(ThreadStore::in_memory().unwrap());
        let transport = Arc::new(MemoryTransport::new());
        seed(&store, &inbound("c", Some(vec!["a", "b"])));

        let outcome = service(&store, &transport).reply_to("c", "thanks", None).await;
        assert!(outcome.ok);

        let sent = transport.sent().await;
        assert_eq!(sent[0].references.as_deref(), Some("<a> <b> <c>"));
    }

    #[tokio::test]
    async fn test_unknown_message_is_not_sent() {
        let store = Arc::new(ThreadStore::in_memory().unwrap());
        let transport = Arc::new(MemoryTransport::new());

        let outcome = service(&store, &transport).reply_to("missing", "thanks", None).await;
        assert_eq!(outcome, SendOutcome::failed());
        assert!(transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_writes_nothing() {
        let store = Arc::new(ThreadStore::in_memory().unwrap());
        let transport = Arc::new(MemoryTransport::new());
        seed(&store, &inbound("b", None));
        transport
            .script_sends(vec![Err(MailError::permanent("535 authentication failed"))])
            .await;

        let outcome = service(&store, &transport).reply_to("b", "thanks", None).await;
        assert_eq!(outcome, SendOutcome::failed());
        assert_eq!(store.thread_messages("k1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_acknowledgment_responder_replies() {
        let store = Arc::new(ThreadStore::in_memory().unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let parsed = inbound("b", None);
        let stored = seed(&store, &parsed);

        let responder =
            AcknowledgmentResponder::new(Arc::new(service(&store, &transport)), "-- mailweave");
        responder.on_message(&parsed, &stored).await.unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body_text.contains("\"Plans\""));
        assert!(sent[0].body_text.ends_with("-- mailweave"));
        assert_eq!(sent[0].references.as_deref(), Some("<b>"));
    }

    #[tokio::test]
    async fn test_reply_to_own_message_skips_system_address() {
        let store = Arc::new(ThreadStore::in_memory().unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let mut own = inbound("out-1", None);
        own.sender = "Bot <BOT@example.com>".to_string();
        seed(&store, &own);

        let outcome = service(&store, &transport).reply_to("out-1", "follow-up", None).await;
        assert!(outcome.ok);
        assert_eq!(transport.sent().await[0].to, vec!["carol@example.com"]);
    }

    #[tokio::test]
    async fn test_reply_with_only_system_address_is_not_sent() {
        let store = Arc::new(ThreadStore::in_memory().unwrap());
        let transport = Arc::new(MemoryTransport::new());
        let mut own = inbound("note-to-self", None);
        own.sender = BOT.to_string();
        own.recipients = vec![BOT.to_string()];
        seed(&store, &own);

        let outcome = service(&store, &transport).reply_to("note-to-self", "hi", None).await;
        assert_eq!(outcome, SendOutcome::failed());
        assert!(transport.sent().await.is_empty());
        assert_eq!(store.thread_messages("k1").unwrap().len(), 1);
    }
}
