//! Unseen-message fetch and seen-flagging over IMAP
//!
//! One session is kept open between calls and re-established after any
//! failure.

pub mod connection;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::ImapConfig;
use crate::types::{RawMessage, Result};
use connection::{connect, imap_error, select, ImapSession};

pub struct ImapMailbox {
    config: ImapConfig,
    session: Mutex<Option<ImapSession>>,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    async fn open_session(&self) -> Result<ImapSession> {
        let mut session = connect(&self.config).await?;
        select(&mut session, &self.config.mailbox).await?;
        Ok(session)
    }

    /// Every unseen message, fetched with `BODY.PEEK[]` so fetching alone does
    /// not set `\Seen`.
    pub async fn fetch_unseen(&self) -> Result<Vec<RawMessage>> {
        let mut guard = self.session.lock().await;
        let mut session = match guard.take() {
            Some(session) => session,
            None => self.open_session().await?,
        };

        // NOOP refreshes the selected mailbox and detects a dead session early
        if let Err(e) = session.noop().await {
            debug!("Cached IMAP session is stale ({}), reconnecting", e);
            session = self.open_session().await?;
        }

        let messages = fetch_unseen_in(&mut session).await?;
        *guard = Some(session);
        Ok(messages)
    }

    pub async fn mark_seen(&self, uid: u32) -> Result<()> {
        let mut guard = self.session.lock().await;
        let mut session = match guard.take() {
            Some(session) => session,
            None => self.open_session().await?,
        };

        let updates = session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .await
            .map_err(|e| imap_error("STORE failed", e))?;
        let updates: Vec<_> = updates.collect().await;
        for update in updates {
            update.map_err(|e| imap_error("STORE failed", e))?;
        }

        *guard = Some(session);
        Ok(())
    }

    pub async fn logout(&self) {
        if let Some(mut session) = self.session.lock().await.take() {
            if let Err(e) = session.logout().await {
                warn!("IMAP logout failed: {}", e);
            }
        }
    }
}

async fn fetch_unseen_in(session: &mut ImapSession) -> Result<Vec<RawMessage>> {
    let uids = session
        .uid_search("UNSEEN")
        .await
        .map_err(|e| imap_error("SEARCH failed", e))?;

    let mut uids: Vec<u32> = uids.into_iter().collect();
    if uids.is_empty() {
        return Ok(Vec::new());
    }
    uids.sort_unstable();

    let uid_set = uids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let stream = session
        .uid_fetch(&uid_set, "(UID BODY.PEEK[])")
        .await
        .map_err(|e| imap_error("FETCH failed", e))?;
    futures::pin_mut!(stream);

    let mut messages = Vec::with_capacity(uids.len());
    while let Some(result) = stream.next().await {
        match result {
            Ok(fetch) => match (fetch.uid, fetch.body()) {
                (Some(uid), Some(body)) => messages.push(RawMessage::new(uid, body)),
                (uid, _) => warn!("FETCH response without UID or body (uid: {:?})", uid),
            },
            Err(e) => warn!("Skipping unparseable IMAP response: {}", e),
        }
    }

    messages.sort_by_key(|m| m.uid);
    debug!("Fetched {} of {} unseen messages", messages.len(), uids.len());
    Ok(messages)
}
