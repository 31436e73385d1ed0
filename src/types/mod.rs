pub mod error;
pub mod message;
pub mod thread;

pub use error::{MailError, Result};
pub use message::{ParsedMessage, RawMessage};
pub use thread::{Message, Thread};
