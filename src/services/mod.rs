//! Engine logic, independent of any concrete mail server or database file
//!
//! - `parser`: raw mail to structured messages, thread keys
//! - `transport`: the mail capability trait, reply threading, send retries
//! - `ingest`: the per-tick pipeline
//! - `poller`: the interval loop driving the pipeline
//! - `reply`: threaded replies recorded back into the store

pub mod helpers;
pub mod ingest;
pub mod parser;
pub mod poller;
pub mod reply;
pub mod transport;

pub use helpers::backoff::RetryPolicy;
pub use ingest::{IngestOutcome, IngestPipeline, MessageHandler, TickReport};
pub use poller::{PollTask, Poller};
pub use reply::{AcknowledgmentResponder, ReplyService};
pub use transport::{ComposedMessage, MailTransport, MemoryTransport, SendOutcome};
