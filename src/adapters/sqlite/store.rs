//! Transactional store for threads and messages
//!
//! All writes go through [`ThreadStore::unit_of_work`]: the closure gets a
//! [`UnitOfWork`] bound to one `IMMEDIATE` transaction, which commits when the
//! closure returns `Ok` and rolls back otherwise.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{ffi, params, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::pool::{create_memory_pool, create_pool, DbConnection, DbPool};
use super::schema::initialize_schema;
use crate::services::helpers::address::normalize_address;
use crate::types::{MailError, Message, ParsedMessage, Result, Thread};

const THREAD_COLUMNS: &str = "id, thread_key, subject, participants, created_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, message_id, thread_id, sender, recipients, cc, subject, \
     body_text, body_html, in_reply_to, references_ids, received_at, is_sent_by_system";

pub struct ThreadStore {
    pool: DbPool,
}

impl ThreadStore {
    /// Open (or create) a file database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let pool = create_pool(path)?;
        let store = Self { pool };
        store.initialize_schema()?;
        info!("Opened thread store at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            pool: create_memory_pool()?,
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<()> {
        self.connection()?.execute_batch(sql)?;
        Ok(())
    }

    fn initialize_schema(&self) -> Result<()> {
        let conn = self.connection()?;
        initialize_schema(&conn)
    }

    /// Run `work` in one transaction. `Ok` commits, `Err` rolls everything back.
    pub fn unit_of_work<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&UnitOfWork<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let uow = UnitOfWork { tx };

        match work(&uow) {
            Ok(value) => {
                uow.tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = uow.tx.rollback() {
                    warn!("Rollback failed after '{}': {}", e, rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Messages of a thread, oldest first. Unknown key yields an empty list.
    pub fn thread_messages(&self, thread_key: &str) -> Result<Vec<Message>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM messages
             WHERE thread_id = (SELECT id FROM threads WHERE thread_key = ?1)
             ORDER BY received_at ASC, id ASC",
            MESSAGE_COLUMNS
        ))?;

        let rows = stmt.query_map(params![thread_key], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// Most recently active threads first.
    pub fn recent_threads(&self, limit: usize) -> Result<Vec<Thread>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM threads ORDER BY updated_at DESC, id DESC LIMIT ?1",
            THREAD_COLUMNS
        ))?;

        let rows = stmt.query_map(params![limit as i64], row_to_thread)?;
        let mut threads = Vec::new();
        for row in rows {
            threads.push(row?);
        }
        Ok(threads)
    }

    /// Flush the WAL and release every pooled connection.
    pub fn close(self) {
        match self.connection() {
            Ok(conn) => {
                if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                    debug!("WAL checkpoint skipped: {}", e);
                }
            }
            Err(e) => warn!("Could not get a connection to checkpoint: {}", e),
        }
        info!("Thread store closed");
    }
}

/// Operations available inside one transaction.
pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
}

impl UnitOfWork<'_> {
    pub fn find_thread_by_key(&self, thread_key: &str) -> Result<Option<Thread>> {
        let thread = self
            .tx
            .query_row(
                &format!("SELECT {} FROM threads WHERE thread_key = ?1", THREAD_COLUMNS),
                params![thread_key],
                row_to_thread,
            )
            .optional()?;
        Ok(thread)
    }

    pub fn find_thread_by_id(&self, id: &str) -> Result<Option<Thread>> {
        let thread = self
            .tx
            .query_row(
                &format!("SELECT {} FROM threads WHERE id = ?1", THREAD_COLUMNS),
                params![id],
                row_to_thread,
            )
            .optional()?;
        Ok(thread)
    }

    pub fn find_message_by_message_id(&self, message_id: &str) -> Result<Option<Message>> {
        let message = self
            .tx
            .query_row(
                &format!("SELECT {} FROM messages WHERE message_id = ?1", MESSAGE_COLUMNS),
                params![message_id],
                row_to_message,
            )
            .optional()?;
        Ok(message)
    }

    /// Insert a new thread with no participants.
    ///
    /// A key that already exists is a [`MailError::Persistence`]; the
    /// transaction stays usable so the caller can re-read the winner.
    pub fn create_thread(&self, thread_key: &str, subject: &str) -> Result<Thread> {
        let now = now_millis();
        let thread = Thread {
            id: Uuid::now_v7().to_string(),
            thread_key: thread_key.to_string(),
            subject: subject.to_string(),
            participants: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        };

        self.tx
            .execute(
                "INSERT INTO threads (id, thread_key, subject, participants, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '[]', ?4, ?5)",
                params![
                    thread.id,
                    thread.thread_key,
                    thread.subject,
                    thread.created_at.timestamp_millis(),
                    thread.updated_at.timestamp_millis(),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e, None) {
                    MailError::Persistence(format!("thread key already exists: {}", thread_key))
                } else {
                    e.into()
                }
            })?;

        debug!(thread_key = %thread_key, "Created thread {}", thread.id);
        Ok(thread)
    }

    /// Merge addresses into the thread's participants.
    ///
    /// Empty entries are ignored. Returns whether anything was added; when
    /// nothing was, no write happens and `updated_at` stays put.
    pub fn add_participants<'a, I>(&self, thread: &mut Thread, addresses: I) -> Result<bool>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut merged = thread.participants.clone();
        for addr in addresses {
            let addr = normalize_address(addr);
            if !addr.is_empty() {
                merged.insert(addr);
            }
        }

        if merged == thread.participants {
            return Ok(false);
        }

        let now = now_millis();
        self.tx.execute(
            "UPDATE threads SET participants = ?1, updated_at = ?2 WHERE id = ?3",
            params![serde_json::to_string(&merged)?, now.timestamp_millis(), thread.id],
        )?;

        thread.participants = merged;
        thread.updated_at = now;
        Ok(true)
    }

    /// Store a message in a thread and bump the thread's `updated_at`.
    ///
    /// A `message_id` already present is a [`MailError::DuplicateMessage`].
    pub fn save_message(
        &self,
        thread_id: &str,
        parsed: &ParsedMessage,
        is_sent_by_system: bool,
    ) -> Result<Message> {
        let message = Message {
            id: Uuid::now_v7().to_string(),
            message_id: parsed.message_id.clone(),
            thread_id: thread_id.to_string(),
            sender: parsed.sender.clone(),
            recipients: parsed.recipients.clone(),
            cc: Some(parsed.cc.clone()).filter(|cc| !cc.is_empty()),
            subject: parsed.subject.clone(),
            body_text: parsed.body_text.clone(),
            body_html: Some(parsed.body_html.clone()).filter(|html| !html.is_empty()),
            in_reply_to: parsed.in_reply_to.clone(),
            references: parsed.references_header(),
            received_at: parsed.received_date,
            is_sent_by_system,
        };

        self.tx
            .execute(
                &format!(
                    "INSERT INTO messages ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    MESSAGE_COLUMNS
                ),
                params![
                    message.id,
                    message.message_id,
                    message.thread_id,
                    message.sender,
                    join_addresses(&message.recipients),
                    message.cc.as_deref().map(join_addresses),
                    message.subject,
                    message.body_text,
                    message.body_html,
                    message.in_reply_to,
                    message.references,
                    message.received_at.timestamp_millis(),
                    message.is_sent_by_system as i32,
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e, Some(ffi::SQLITE_CONSTRAINT_UNIQUE)) {
                    MailError::DuplicateMessage(parsed.message_id.clone())
                } else {
                    e.into()
                }
            })?;

        self.tx.execute(
            "UPDATE threads SET updated_at = MAX(updated_at, ?1) WHERE id = ?2",
            params![now_millis().timestamp_millis(), thread_id],
        )?;

        Ok(message)
    }
}

fn is_constraint_violation(err: &rusqlite::Error, extended: Option<i32>) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && extended.map_or(true, |code| e.extended_code == code)
        }
        _ => false,
    }
}

/// Millisecond precision, matching what the columns can hold.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    from_millis(now.timestamp_millis()).unwrap_or(now)
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

fn millis_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    from_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn join_addresses(addresses: &[String]) -> String {
    addresses.join(", ")
}

fn split_column(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

fn row_to_thread(row: &Row) -> rusqlite::Result<Thread> {
    let participants: String = row.get(3)?;
    let participants: BTreeSet<String> = serde_json::from_str(&participants)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

    Ok(Thread {
        id: row.get(0)?,
        thread_key: row.get(1)?,
        subject: row.get(2)?,
        participants,
        created_at: millis_column(row, 4)?,
        updated_at: millis_column(row, 5)?,
    })
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        message_id: row.get(1)?,
        thread_id: row.get(2)?,
        sender: row.get(3)?,
        recipients: split_column(&row.get::<_, String>(4)?),
        cc: row.get::<_, Option<String>>(5)?.map(|cc| split_column(&cc)),
        subject: row.get(6)?,
        body_text: row.get(7)?,
        body_html: row.get(8)?,
        in_reply_to: row.get(9)?,
        references: row.get(10)?,
        received_at: millis_column(row, 11)?,
        is_sent_by_system: row.get::<_, i32>(12)? != 0,
    })
}
