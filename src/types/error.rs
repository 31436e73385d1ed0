//! Unified error type for the ingestion engine
//!
//! Every fallible operation in the crate returns [`MailError`]. The variants
//! follow how callers react to them:
//! - `Transport`: connectivity/auth/protocol failures (sends retry, fetches wait a tick)
//! - `Parse`: a single malformed message, skipped by the pipeline
//! - `Persistence`: the unit of work was rolled back
//! - `DuplicateMessage`: the message was already stored; an idempotency outcome, not a fault

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum MailError {
    #[error("Transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Message already stored: {0}")]
    DuplicateMessage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl MailError {
    /// A failure worth retrying (dropped connection, timeout, busy server).
    pub fn transient(message: impl Into<String>) -> Self {
        MailError::Transport {
            message: message.into(),
            transient: true,
        }
    }

    /// A failure that will not go away on retry (bad credentials, invalid address).
    pub fn permanent(message: impl Into<String>) -> Self {
        MailError::Transport {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, MailError::Transport { transient: true, .. })
    }
}

impl From<rusqlite::Error> for MailError {
    fn from(err: rusqlite::Error) -> Self {
        MailError::Persistence(err.to_string())
    }
}

impl From<r2d2::Error> for MailError {
    fn from(err: r2d2::Error) -> Self {
        MailError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for MailError {
    fn from(err: serde_json::Error) -> Self {
        MailError::Persistence(err.to_string())
    }
}

impl From<mailparse::MailParseError> for MailError {
    fn from(err: mailparse::MailParseError) -> Self {
        MailError::Parse(err.to_string())
    }
}

impl From<std::io::Error> for MailError {
    fn from(err: std::io::Error) -> Self {
        MailError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for MailError {
    fn from(err: toml::de::Error) -> Self {
        MailError::Config(err.to_string())
    }
}

/// Result type alias using MailError
pub type Result<T> = std::result::Result<T, MailError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(MailError::transient("connection reset").is_transient());
        assert!(!MailError::permanent("535 auth failed").is_transient());
        assert!(!MailError::Persistence("locked".into()).is_transient());
    }

    #[test]
    fn test_display() {
        let err = MailError::DuplicateMessage("abc@example.com".into());
        assert_eq!(err.to_string(), "Message already stored: abc@example.com");

        let err = MailError::transient("timed out");
        assert_eq!(err.to_string(), "Transport error: timed out");
    }
}
