//! mailweave - mailbox ingestion and conversation threading
//!
//! Polls a mailbox for unseen mail, groups messages into conversations even
//! when threading headers are missing, stores each message exactly once, and
//! sends threaded replies.
//!
//! ## Module Organization
//!
//! - `types/`: Data structures and the error type
//! - `config/`: Environment and file configuration
//! - `services/`: Parsing, threading, the ingest pipeline, polling and replies
//! - `adapters/`: SQLite store, IMAP fetch and SMTP send

pub mod adapters;
pub mod config;
pub mod services;
pub mod types;

pub use adapters::sqlite::{ThreadStore, UnitOfWork};
pub use adapters::ImapSmtpTransport;
pub use config::AppConfig;
pub use services::{
    AcknowledgmentResponder, ComposedMessage, IngestOutcome, IngestPipeline, MailTransport,
    MemoryTransport, MessageHandler, PollTask, Poller, ReplyService, RetryPolicy, SendOutcome,
    TickReport,
};
pub use types::{MailError, Message, ParsedMessage, RawMessage, Result, Thread};
