//! Raw mail → [`ParsedMessage`], and thread-key derivation
//!
//! The thread key correlates messages into one conversation independently of
//! the storage id. It is derived, in priority order, from the first id in
//! `References`, the id in `In-Reply-To`, or the cleaned subject plus sender.

use chrono::{DateTime, TimeZone, Utc};
use encoding_rs::Encoding;
use mailparse::{DispositionType, MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::services::helpers::address::{header_addresses, normalize_address};
use crate::types::{MailError, ParsedMessage, Result};

static MESSAGE_ID_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<([^<>]+)>").expect("valid message-id pattern"));

static REPLY_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(re|fwd)(\[\d+\])?:\s*").expect("valid reply-prefix pattern"));

const NO_SUBJECT: &str = "No Subject";

/// Parse a raw RFC 5322 message.
///
/// Fails with [`MailError::Parse`] when the envelope is unusable (headers do not
/// parse, or there is no sender). Body decoding never fails.
pub fn parse_message(raw: &[u8]) -> Result<ParsedMessage> {
    let mail = mailparse::parse_mail(raw)?;
    let headers = &mail.headers;

    let sender = headers
        .get_first_header("From")
        .map(header_addresses)
        .and_then(|addrs| addrs.into_iter().next())
        .ok_or_else(|| MailError::Parse("message has no From address".to_string()))?;

    let message_id = headers
        .get_first_value("Message-ID")
        .and_then(|v| single_message_id(&v))
        .unwrap_or_else(|| synthesize_message_id(raw));

    let in_reply_to_value = headers.get_first_value("In-Reply-To");
    let in_reply_to = in_reply_to_value.as_deref().and_then(single_message_id);
    let thread_parent = in_reply_to_value
        .as_deref()
        .and_then(|v| extract_message_ids(v).into_iter().next());

    let references = headers
        .get_first_value("References")
        .map(|v| extract_message_ids(&v))
        .filter(|ids| !ids.is_empty());

    let recipients = headers
        .get_first_header("To")
        .map(header_addresses)
        .unwrap_or_default();

    let cc = headers
        .get_first_header("Cc")
        .map(header_addresses)
        .unwrap_or_default();

    let subject = headers.get_first_value("Subject").unwrap_or_default();

    let received_date = headers
        .get_first_value("Date")
        .and_then(|v| parse_date(&v))
        .unwrap_or_else(Utc::now);

    let (body_text, body_html) = extract_bodies(&mail);

    Ok(ParsedMessage {
        message_id,
        in_reply_to,
        thread_parent,
        references,
        subject,
        sender,
        recipients,
        cc,
        body_text,
        body_html,
        received_date,
    })
}

/// Derive the thread key of a parsed message.
pub fn thread_key(message: &ParsedMessage) -> String {
    if let Some(first) = message.references.as_ref().and_then(|refs| refs.first()) {
        return first.clone();
    }

    if let Some(parent) = message.thread_parent.as_ref().filter(|id| !id.is_empty()) {
        return parent.clone();
    }

    format!("{}_{}", clean_subject(&message.subject), message.sender)
}

/// Strip up to two leading `Re:` / `Fwd:` / `Re[n]:` / `Fwd[n]:` prefixes.
pub fn clean_subject(subject: &str) -> String {
    let mut cleaned = subject.trim_start();
    for _ in 0..2 {
        match REPLY_PREFIX.find(cleaned) {
            Some(m) => cleaned = &cleaned[m.end()..],
            None => break,
        }
    }

    if cleaned.is_empty() {
        NO_SUBJECT.to_string()
    } else {
        cleaned.to_string()
    }
}

/// All `<...>` ids of a header value, brackets removed, in order.
pub fn extract_message_ids(value: &str) -> Vec<String> {
    MESSAGE_ID_TOKEN
        .captures_iter(value)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|id| !id.is_empty())
        .collect()
}

/// The id carried by a single-id header. Bare ids without brackets are
/// accepted as long as they are one token; they are stored but never thread.
fn single_message_id(value: &str) -> Option<String> {
    if let Some(id) = extract_message_ids(value).into_iter().next() {
        return Some(id);
    }

    let bare = value.trim().trim_matches(|c| c == '<' || c == '>');
    if bare.is_empty() || bare.contains(char::is_whitespace) {
        None
    } else {
        Some(bare.to_string())
    }
}

/// Stable id for messages that arrive without a Message-ID, so a refetch of
/// the same bytes still deduplicates.
fn synthesize_message_id(raw: &[u8]) -> String {
    let hash = Sha256::digest(raw);
    let hex: String = hash.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    let id = format!("{}@mailweave.local", hex);
    debug!(message_id = %id, "Message has no Message-ID, synthesized one");
    id
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let secs = mailparse::dateparse(value).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

fn extract_bodies(mail: &ParsedMail) -> (String, String) {
    let mut text = None;
    let mut html = None;
    walk_parts(mail, &mut text, &mut html);
    (text.unwrap_or_default(), html.unwrap_or_default())
}

fn walk_parts(part: &ParsedMail, text: &mut Option<String>, html: &mut Option<String>) {
    if is_attachment(part) {
        return;
    }

    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, text, html);
        }
        return;
    }

    match part.ctype.mimetype.to_ascii_lowercase().as_str() {
        "text/plain" if text.is_none() => *text = Some(decode_part(part)),
        "text/html" if html.is_none() => *html = Some(decode_part(part)),
        _ => {}
    }
}

fn is_attachment(part: &ParsedMail) -> bool {
    matches!(
        part.get_content_disposition().disposition,
        DispositionType::Attachment
    )
}

/// Decode a leaf part with its declared charset, falling back to Latin-1
/// when the bytes do not decode.
fn decode_part(part: &ParsedMail) -> String {
    let raw = match part.get_body_raw() {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "Could not undo transfer encoding, dropping body part");
            return String::new();
        }
    };

    let charset = part.ctype.charset.to_ascii_lowercase();
    match charset.as_str() {
        "" | "utf-8" | "utf8" | "us-ascii" | "ascii" => {
            String::from_utf8(raw).unwrap_or_else(|e| {
                debug!("Body is not valid {}, decoding as latin-1", charset);
                latin1(&e.into_bytes())
            })
        }
        label => match Encoding::for_label(label.as_bytes()) {
            Some(encoding) => encoding
                .decode_without_bom_handling_and_without_replacement(&raw)
                .map(|text| text.into_owned())
                .unwrap_or_else(|| {
                    debug!("Body is not valid {}, decoding as latin-1", charset);
                    latin1(&raw)
                }),
            None => {
                debug!("Unknown charset {}, decoding as latin-1", charset);
                latin1(&raw)
            }
        },
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Normalized sender of a raw message without a full parse, used for
/// diagnostics when a message fails to parse.
pub fn peek_sender(raw: &[u8]) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(raw).ok()?;
    headers
        .get_first_value("From")
        .map(|v| normalize_address(&v))
        .filter(|s| !s.is_empty())
}
