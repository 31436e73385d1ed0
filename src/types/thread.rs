use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A persisted conversation.
///
/// `thread_key` is the derived correlation identity and never changes;
/// `id` is the storage key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub thread_key: String,
    pub subject: String,
    pub participants: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted message, owned by exactly one [`Thread`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub message_id: String,
    pub thread_id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Option<Vec<String>>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub received_at: DateTime<Utc>,
    pub is_sent_by_system: bool,
}
