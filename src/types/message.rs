use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as handed over by the transport, before parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Transport handle (IMAP UID) used to mark the message seen.
    pub uid: u32,
    /// Full RFC 5322 message.
    pub bytes: Vec<u8>,
}

impl RawMessage {
    pub fn new(uid: u32, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            uid,
            bytes: bytes.into(),
        }
    }
}

/// Structured view of one inbound (or outbound) mail.
///
/// Ids are stored without angle brackets. Absent bodies are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    /// Parent id from a well-formed `<...>` In-Reply-To token. Only this one
    /// takes part in threading; a bare header value does not.
    #[serde(default)]
    pub thread_parent: Option<String>,
    pub references: Option<Vec<String>>,
    pub subject: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub body_text: String,
    pub body_html: String,
    pub received_date: DateTime<Utc>,
}

impl ParsedMessage {
    /// References rendered the way they travel in a header: `<a> <b>`.
    pub fn references_header(&self) -> Option<String> {
        self.references
            .as_ref()
            .filter(|refs| !refs.is_empty())
            .map(|refs| {
                refs.iter()
                    .map(|id| format!("<{}>", id))
                    .collect::<Vec<_>>()
                    .join(" ")
            })
    }

    /// Sender followed by every non-empty recipient.
    pub fn participant_addresses(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.sender.as_str())
            .chain(self.recipients.iter().map(String::as_str))
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
    }
}
