//! Ingest pipeline
//!
//! One tick fetches the unseen set and walks each message through
//! parse → own-address filter → dedup → thread resolution → persist → callbacks.
//! Failures are isolated per message; only a failed fetch aborts the tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::adapters::sqlite::{ThreadStore, UnitOfWork};
use crate::services::helpers::address::same_address;
use crate::services::parser::{parse_message, peek_sender, thread_key};
use crate::services::transport::MailTransport;
use crate::types::{MailError, Message, ParsedMessage, RawMessage, Result, Thread};

/// Called once for every newly persisted inbound message, after commit.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, parsed: &ParsedMessage, stored: &Message) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Newly stored; callbacks ran.
    Persisted(Message),
    /// Already stored under the same Message-ID. Nothing was written.
    Skipped,
    /// Sent from the system's own address. Nothing was written.
    Filtered,
}

/// Counters for one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub fetched: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub filtered: usize,
    pub parse_failures: usize,
    pub failures: usize,
}

pub struct IngestPipeline {
    store: Arc<ThreadStore>,
    transport: Arc<dyn MailTransport>,
    system_address: String,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl IngestPipeline {
    pub fn new(
        store: Arc<ThreadStore>,
        transport: Arc<dyn MailTransport>,
        system_address: impl Into<String>,
    ) -> Self {
        Self {
            store,
            transport,
            system_address: system_address.into(),
            handlers: Vec::new(),
        }
    }

    pub fn register_callback(&mut self, handler: Arc<dyn MessageHandler>) {
        self.handlers.push(handler);
    }

    /// Fetch the unseen set and process it.
    ///
    /// A message is marked seen once it reaches a terminal outcome, including
    /// a parse failure. A persistence failure leaves it unseen for the next tick.
    pub async fn run_tick(&self) -> Result<TickReport> {
        let batch = self.transport.fetch_unseen().await?;
        let mut report = TickReport {
            fetched: batch.len(),
            ..TickReport::default()
        };

        if batch.is_empty() {
            debug!("No unseen messages");
            return Ok(report);
        }

        for raw in &batch {
            let terminal = match self.process_raw(raw).await {
                Ok(IngestOutcome::Persisted(_)) => {
                    report.persisted += 1;
                    true
                }
                Ok(IngestOutcome::Skipped) => {
                    report.skipped += 1;
                    true
                }
                Ok(IngestOutcome::Filtered) => {
                    report.filtered += 1;
                    true
                }
                Err(MailError::Parse(e)) => {
                    warn!(
                        uid = raw.uid,
                        "Skipping unparseable message from {}: {}",
                        peek_sender(&raw.bytes).unwrap_or_else(|| "<unknown>".to_string()),
                        e
                    );
                    report.parse_failures += 1;
                    true
                }
                Err(e) => {
                    error!(uid = raw.uid, "Failed to ingest message, will retry: {}", e);
                    report.failures += 1;
                    false
                }
            };

            if terminal {
                if let Err(e) = self.transport.mark_seen(raw.uid).await {
                    warn!(uid = raw.uid, "Failed to mark message seen: {}", e);
                }
            }
        }

        info!(
            "Tick done: {} fetched, {} persisted, {} skipped, {} filtered, {} unparseable, {} failed",
            report.fetched,
            report.persisted,
            report.skipped,
            report.filtered,
            report.parse_failures,
            report.failures
        );
        Ok(report)
    }

    pub async fn process_raw(&self, raw: &RawMessage) -> Result<IngestOutcome> {
        let parsed = parse_message(&raw.bytes)?;
        self.process_parsed(&parsed).await
    }

    pub async fn process_parsed(&self, parsed: &ParsedMessage) -> Result<IngestOutcome> {
        if same_address(&parsed.sender, &self.system_address) {
            info!(message_id = %parsed.message_id, "Ignoring message sent from own address");
            return Ok(IngestOutcome::Filtered);
        }

        let stored = match self.store.unit_of_work(|uow| persist_inbound(uow, parsed)) {
            Ok(stored) => stored,
            Err(MailError::DuplicateMessage(_)) => None,
            Err(e) => return Err(e),
        };

        let Some(message) = stored else {
            debug!(message_id = %parsed.message_id, "Message already stored, skipping");
            return Ok(IngestOutcome::Skipped);
        };

        info!(
            message_id = %message.message_id,
            "Stored message from {} in thread {}", message.sender, message.thread_id
        );

        for handler in &self.handlers {
            if let Err(e) = handler.on_message(parsed, &message).await {
                error!(message_id = %message.message_id, "Message callback failed: {}", e);
            }
        }

        Ok(IngestOutcome::Persisted(message))
    }
}

/// Dedup, resolve the thread, merge participants, and store. `None` when the
/// message is already present.
fn persist_inbound(uow: &UnitOfWork<'_>, parsed: &ParsedMessage) -> Result<Option<Message>> {
    if uow.find_message_by_message_id(&parsed.message_id)?.is_some() {
        return Ok(None);
    }

    let key = thread_key(parsed);
    let mut thread = resolve_thread(uow, &key, &parsed.subject)?;
    uow.add_participants(&mut thread, parsed.participant_addresses())?;
    let message = uow.save_message(&thread.id, parsed, false)?;
    Ok(Some(message))
}

/// Find the thread for `key`, creating it if needed. A failed creation is
/// resolved by reading the winner; if there is none, the creation error stands.
///
/// Units of work are `IMMEDIATE` transactions, so writers are serialized and
/// the find above already sees any committed thread. The re-read only matters
/// for a store shared with writers that bypass that locking.
pub(crate) fn resolve_thread(uow: &UnitOfWork<'_>, key: &str, subject: &str) -> Result<Thread> {
    if let Some(thread) = uow.find_thread_by_key(key)? {
        return Ok(thread);
    }

    match uow.create_thread(key, subject) {
        Ok(thread) => Ok(thread),
        Err(e) => match uow.find_thread_by_key(key)? {
            Some(thread) => {
                debug!(thread_key = %key, "Thread created concurrently, using existing one");
                Ok(thread)
            }
            None => Err(e),
        },
    }
}
